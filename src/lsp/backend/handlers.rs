//! LSP protocol handlers.
//!
//! Every request handler follows the same shape: route the URI to a scope,
//! ensure its AST is current, delegate to the feature provider, and fail
//! soft: a provider error is logged and answered with the type-appropriate
//! empty result, never a protocol error. Notifications delegate to the
//! [`ServerCore`] entry points.

use tower_lsp::jsonrpc::Result as LspResult;
use tower_lsp::lsp_types::request::{
    GotoImplementationParams, GotoImplementationResponse, GotoTypeDefinitionParams,
    GotoTypeDefinitionResponse,
};
use tower_lsp::lsp_types::{
    CodeActionParams, CodeActionProviderCapability, CodeActionResponse, CompletionItem,
    CompletionOptions, CompletionParams, CompletionResponse, DidChangeConfigurationParams,
    DidChangeTextDocumentParams, DidChangeWatchedFilesParams, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, DidSaveTextDocumentParams, DocumentFormattingParams,
    DocumentHighlight, DocumentHighlightParams, DocumentSymbolParams, DocumentSymbolResponse,
    GotoDefinitionParams, GotoDefinitionResponse, Hover, HoverParams, HoverProviderCapability,
    ImplementationProviderCapability, InitializeParams, InitializeResult, InitializedParams,
    InlayHint, InlayHintParams, Location, OneOf, PrepareRenameResponse, ReferenceParams,
    RenameOptions, RenameParams, SemanticTokenType, SemanticTokensFullOptions,
    SemanticTokensLegend, SemanticTokensOptions, SemanticTokensParams,
    SemanticTokensRangeParams, SemanticTokensRangeResult, SemanticTokensResult,
    SemanticTokensServerCapabilities, ServerCapabilities, ServerInfo, SignatureHelp,
    SignatureHelpOptions, SignatureHelpParams, SymbolInformation, TextDocumentPositionParams,
    TextDocumentSyncCapability, TextDocumentSyncKind, TextEdit, TypeDefinitionProviderCapability,
    WorkspaceEdit, WorkspaceSymbolParams,
};
use tower_lsp::{LanguageServer, jsonrpc};
use tracing::{debug, info, warn};

use crate::config::{PROTOCOL_VERSION, ServerOptions};
use crate::lsp::backend::GroovyBackend;
use crate::lsp::protocol::GetDecompiledContentParams;

/// Logs a provider failure and substitutes the empty result.
macro_rules! fail_soft {
    ($what:literal, $call:expr, $empty:expr) => {
        match $call {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(concat!($what, " provider failed: {:#}"), e);
                Ok($empty)
            }
        }
    };
}

impl GroovyBackend {
    pub async fn get_protocol_version(&self) -> LspResult<String> {
        Ok(PROTOCOL_VERSION.to_string())
    }

    pub async fn get_decompiled_content(
        &self,
        params: GetDecompiledContentParams,
    ) -> LspResult<Option<String>> {
        fail_soft!(
            "decompile",
            self.providers().decompiled_content(&params.class_name).await,
            None
        )
    }

    fn providers(&self) -> &std::sync::Arc<dyn crate::lsp::providers::FeatureProviders> {
        &self.providers
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for GroovyBackend {
    async fn initialize(&self, params: InitializeParams) -> jsonrpc::Result<InitializeResult> {
        let options = ServerOptions::from_initialization_options(params.initialization_options);
        crate::logging::init_logger(options.log_level);
        info!("initializing groovy language server (protocol {})", PROTOCOL_VERSION);

        let workspace_root = params
            .root_uri
            .as_ref()
            .and_then(|uri| uri.to_file_path().ok());
        self.install_core(options, workspace_root);

        Ok(InitializeResult {
            server_info: Some(ServerInfo {
                name: "groovy-language-server".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Kind(
                    TextDocumentSyncKind::INCREMENTAL,
                )),
                hover_provider: Some(HoverProviderCapability::Simple(true)),
                completion_provider: Some(CompletionOptions {
                    trigger_characters: Some(vec![".".to_string()]),
                    resolve_provider: Some(true),
                    ..Default::default()
                }),
                signature_help_provider: Some(SignatureHelpOptions {
                    trigger_characters: Some(vec!["(".to_string(), ",".to_string()]),
                    retrigger_characters: None,
                    work_done_progress_options: Default::default(),
                }),
                definition_provider: Some(OneOf::Left(true)),
                type_definition_provider: Some(TypeDefinitionProviderCapability::Simple(true)),
                implementation_provider: Some(ImplementationProviderCapability::Simple(true)),
                references_provider: Some(OneOf::Left(true)),
                document_highlight_provider: Some(OneOf::Left(true)),
                document_symbol_provider: Some(OneOf::Left(true)),
                workspace_symbol_provider: Some(OneOf::Left(true)),
                rename_provider: Some(OneOf::Right(RenameOptions {
                    prepare_provider: Some(true),
                    work_done_progress_options: Default::default(),
                })),
                code_action_provider: Some(CodeActionProviderCapability::Simple(true)),
                inlay_hint_provider: Some(OneOf::Left(true)),
                document_formatting_provider: Some(OneOf::Left(true)),
                semantic_tokens_provider: Some(
                    SemanticTokensServerCapabilities::SemanticTokensOptions(
                        SemanticTokensOptions {
                            legend: SemanticTokensLegend {
                                token_types: vec![
                                    SemanticTokenType::CLASS,
                                    SemanticTokenType::METHOD,
                                    SemanticTokenType::PROPERTY,
                                    SemanticTokenType::VARIABLE,
                                    SemanticTokenType::PARAMETER,
                                    SemanticTokenType::KEYWORD,
                                    SemanticTokenType::STRING,
                                    SemanticTokenType::NUMBER,
                                    SemanticTokenType::COMMENT,
                                ],
                                token_modifiers: vec![],
                            },
                            range: Some(true),
                            full: Some(SemanticTokensFullOptions::Bool(true)),
                            ..Default::default()
                        },
                    ),
                ),
                ..Default::default()
            },
        })
    }

    async fn initialized(&self, _params: InitializedParams) {
        if let Some(core) = self.core() {
            core.initialize_workspace().await;
        }
    }

    async fn shutdown(&self) -> jsonrpc::Result<()> {
        info!("shutdown requested");
        if let Some(core) = self.core() {
            core.shutdown();
        }
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        debug!("didOpen {}", params.text_document.uri);
        if let Some(core) = self.core() {
            core.did_open(
                params.text_document.uri,
                params.text_document.text,
                params.text_document.version,
            )
            .await;
        }
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        if let Some(core) = self.core() {
            core.did_change(
                params.text_document.uri,
                params.text_document.version,
                params.content_changes,
            );
        }
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        if let Some(core) = self.core() {
            core.did_save(params.text_document.uri);
        }
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        if let Some(core) = self.core() {
            core.did_close(&params.text_document.uri);
        }
    }

    async fn did_change_watched_files(&self, params: DidChangeWatchedFilesParams) {
        if let Some(core) = self.core() {
            core.did_change_watched_files(params.changes).await;
        }
    }

    async fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        if let Some(core) = self.core() {
            core.did_change_configuration(params.settings).await;
        }
    }

    async fn hover(&self, params: HoverParams) -> jsonrpc::Result<Option<Hover>> {
        let Some(core) = self.core() else {
            return Ok(None);
        };
        let uri = &params.text_document_position_params.text_document.uri;
        let Some(scope) = core.ensure_ready(uri).await else {
            return Ok(None);
        };
        fail_soft!("hover", self.providers().hover(scope, params).await, None)
    }

    async fn completion(
        &self,
        params: CompletionParams,
    ) -> jsonrpc::Result<Option<CompletionResponse>> {
        let Some(core) = self.core() else {
            return Ok(None);
        };
        let position = params.text_document_position.position;
        let uri = params.text_document_position.text_document.uri.clone();
        let Some(scope) = core.ensure_ready_at(&uri, position).await else {
            return Ok(None);
        };
        fail_soft!(
            "completion",
            self.providers().completion(scope, params).await,
            None
        )
    }

    async fn completion_resolve(&self, item: CompletionItem) -> jsonrpc::Result<CompletionItem> {
        let fallback = item.clone();
        fail_soft!(
            "completion resolve",
            self.providers().completion_resolve(item).await,
            fallback
        )
    }

    async fn signature_help(
        &self,
        params: SignatureHelpParams,
    ) -> jsonrpc::Result<Option<SignatureHelp>> {
        let Some(core) = self.core() else {
            return Ok(None);
        };
        let position = params.text_document_position_params.position;
        let uri = params
            .text_document_position_params
            .text_document
            .uri
            .clone();
        let Some(scope) = core.ensure_ready_at(&uri, position).await else {
            return Ok(None);
        };
        fail_soft!(
            "signature help",
            self.providers().signature_help(scope, params).await,
            None
        )
    }

    async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> jsonrpc::Result<Option<GotoDefinitionResponse>> {
        let Some(core) = self.core() else {
            return Ok(None);
        };
        let uri = &params.text_document_position_params.text_document.uri;
        let Some(scope) = core.ensure_ready(uri).await else {
            return Ok(None);
        };
        fail_soft!(
            "definition",
            self.providers().goto_definition(scope, params).await,
            None
        )
    }

    async fn goto_type_definition(
        &self,
        params: GotoTypeDefinitionParams,
    ) -> jsonrpc::Result<Option<GotoTypeDefinitionResponse>> {
        let Some(core) = self.core() else {
            return Ok(None);
        };
        let uri = &params.text_document_position_params.text_document.uri;
        let Some(scope) = core.ensure_ready(uri).await else {
            return Ok(None);
        };
        fail_soft!(
            "type definition",
            self.providers().goto_type_definition(scope, params).await,
            None
        )
    }

    async fn goto_implementation(
        &self,
        params: GotoImplementationParams,
    ) -> jsonrpc::Result<Option<GotoImplementationResponse>> {
        let Some(core) = self.core() else {
            return Ok(None);
        };
        let uri = &params.text_document_position_params.text_document.uri;
        let Some(scope) = core.ensure_ready(uri).await else {
            return Ok(None);
        };
        fail_soft!(
            "implementation",
            self.providers().goto_implementation(scope, params).await,
            None
        )
    }

    async fn references(&self, params: ReferenceParams) -> jsonrpc::Result<Option<Vec<Location>>> {
        let Some(core) = self.core() else {
            return Ok(None);
        };
        let uri = &params.text_document_position.text_document.uri;
        let Some(scope) = core.ensure_ready(uri).await else {
            return Ok(None);
        };
        fail_soft!(
            "references",
            self.providers().references(scope, params).await,
            None
        )
    }

    async fn document_highlight(
        &self,
        params: DocumentHighlightParams,
    ) -> jsonrpc::Result<Option<Vec<DocumentHighlight>>> {
        let Some(core) = self.core() else {
            return Ok(None);
        };
        let uri = &params.text_document_position_params.text_document.uri;
        let Some(scope) = core.ensure_ready(uri).await else {
            return Ok(None);
        };
        fail_soft!(
            "document highlight",
            self.providers().document_highlight(scope, params).await,
            None
        )
    }

    async fn document_symbol(
        &self,
        params: DocumentSymbolParams,
    ) -> jsonrpc::Result<Option<DocumentSymbolResponse>> {
        let Some(core) = self.core() else {
            return Ok(None);
        };
        let Some(scope) = core.ensure_ready(&params.text_document.uri).await else {
            return Ok(None);
        };
        fail_soft!(
            "document symbol",
            self.providers().document_symbol(scope, params).await,
            None
        )
    }

    async fn symbol(
        &self,
        params: WorkspaceSymbolParams,
    ) -> jsonrpc::Result<Option<Vec<SymbolInformation>>> {
        fail_soft!(
            "workspace symbol",
            self.providers().workspace_symbol(params).await,
            None
        )
    }

    async fn rename(&self, params: RenameParams) -> jsonrpc::Result<Option<WorkspaceEdit>> {
        let Some(core) = self.core() else {
            return Ok(None);
        };
        let uri = &params.text_document_position.text_document.uri;
        let Some(scope) = core.ensure_ready(uri).await else {
            return Ok(None);
        };
        fail_soft!("rename", self.providers().rename(scope, params).await, None)
    }

    async fn prepare_rename(
        &self,
        params: TextDocumentPositionParams,
    ) -> jsonrpc::Result<Option<PrepareRenameResponse>> {
        let Some(core) = self.core() else {
            return Ok(None);
        };
        let Some(scope) = core.ensure_ready(&params.text_document.uri).await else {
            return Ok(None);
        };
        fail_soft!(
            "prepare rename",
            self.providers().prepare_rename(scope, params).await,
            None
        )
    }

    async fn code_action(
        &self,
        params: CodeActionParams,
    ) -> jsonrpc::Result<Option<CodeActionResponse>> {
        let Some(core) = self.core() else {
            return Ok(None);
        };
        let Some(scope) = core.ensure_ready(&params.text_document.uri).await else {
            return Ok(None);
        };
        fail_soft!(
            "code action",
            self.providers().code_action(scope, params).await,
            None
        )
    }

    async fn inlay_hint(
        &self,
        params: InlayHintParams,
    ) -> jsonrpc::Result<Option<Vec<InlayHint>>> {
        let Some(core) = self.core() else {
            return Ok(None);
        };
        let Some(scope) = core.ensure_ready(&params.text_document.uri).await else {
            return Ok(None);
        };
        fail_soft!(
            "inlay hint",
            self.providers().inlay_hint(scope, params).await,
            None
        )
    }

    async fn semantic_tokens_full(
        &self,
        params: SemanticTokensParams,
    ) -> jsonrpc::Result<Option<SemanticTokensResult>> {
        let Some(core) = self.core() else {
            return Ok(None);
        };
        if !core.workspace_config.read().semantic_highlighting_enabled {
            return Ok(None);
        }
        let Some(scope) = core.ensure_ready(&params.text_document.uri).await else {
            return Ok(None);
        };
        fail_soft!(
            "semantic tokens",
            self.providers().semantic_tokens_full(scope, params).await,
            None
        )
    }

    async fn semantic_tokens_range(
        &self,
        params: SemanticTokensRangeParams,
    ) -> jsonrpc::Result<Option<SemanticTokensRangeResult>> {
        let Some(core) = self.core() else {
            return Ok(None);
        };
        if !core.workspace_config.read().semantic_highlighting_enabled {
            return Ok(None);
        }
        let Some(scope) = core.ensure_ready(&params.text_document.uri).await else {
            return Ok(None);
        };
        fail_soft!(
            "semantic tokens range",
            self.providers().semantic_tokens_range(scope, params).await,
            None
        )
    }

    async fn formatting(
        &self,
        params: DocumentFormattingParams,
    ) -> jsonrpc::Result<Option<Vec<TextEdit>>> {
        let Some(core) = self.core() else {
            return Ok(None);
        };
        if !core.workspace_config.read().formatting_enabled {
            return Ok(None);
        }
        let Some(scope) = core.ensure_ready(&params.text_document.uri).await else {
            return Ok(None);
        };
        fail_soft!(
            "formatting",
            self.providers().formatting(scope, params).await,
            None
        )
    }
}
