//! Feature provider seam.
//!
//! Individual LSP features (hover, completion, navigation, …) are not part
//! of the orchestrator core; they are consumed as an opaque service. The
//! backend guarantees the scope is routed, resolved, and compiled before a
//! provider runs, then hands over the scope so the provider can snapshot the
//! AST index. Every method defaults to the type-appropriate empty result, so
//! a bare core is a fully functional (if featureless) server.

use std::sync::Arc;

use tower_lsp::lsp_types::request::{
    GotoImplementationParams, GotoImplementationResponse, GotoTypeDefinitionParams,
    GotoTypeDefinitionResponse,
};
use tower_lsp::lsp_types::{
    CodeActionParams, CodeActionResponse, CompletionItem, CompletionParams, CompletionResponse,
    DocumentFormattingParams, DocumentHighlight, DocumentHighlightParams, DocumentSymbolParams,
    DocumentSymbolResponse, GotoDefinitionParams, GotoDefinitionResponse, Hover, HoverParams,
    InlayHint, InlayHintParams, Location, PrepareRenameResponse, ReferenceParams, RenameParams,
    SemanticTokensParams, SemanticTokensRangeParams, SemanticTokensRangeResult,
    SemanticTokensResult, SignatureHelp, SignatureHelpParams, SymbolInformation, TextEdit,
    TextDocumentPositionParams, WorkspaceEdit, WorkspaceSymbolParams,
};

use crate::workspace::ProjectScope;

#[tower_lsp::async_trait]
pub trait FeatureProviders: Send + Sync + 'static {
    async fn hover(
        &self,
        scope: Arc<ProjectScope>,
        params: HoverParams,
    ) -> anyhow::Result<Option<Hover>> {
        let _ = (scope, params);
        Ok(None)
    }

    async fn completion(
        &self,
        scope: Arc<ProjectScope>,
        params: CompletionParams,
    ) -> anyhow::Result<Option<CompletionResponse>> {
        let _ = (scope, params);
        Ok(None)
    }

    async fn completion_resolve(&self, item: CompletionItem) -> anyhow::Result<CompletionItem> {
        Ok(item)
    }

    async fn signature_help(
        &self,
        scope: Arc<ProjectScope>,
        params: SignatureHelpParams,
    ) -> anyhow::Result<Option<SignatureHelp>> {
        let _ = (scope, params);
        Ok(None)
    }

    async fn goto_definition(
        &self,
        scope: Arc<ProjectScope>,
        params: GotoDefinitionParams,
    ) -> anyhow::Result<Option<GotoDefinitionResponse>> {
        let _ = (scope, params);
        Ok(None)
    }

    async fn goto_type_definition(
        &self,
        scope: Arc<ProjectScope>,
        params: GotoTypeDefinitionParams,
    ) -> anyhow::Result<Option<GotoTypeDefinitionResponse>> {
        let _ = (scope, params);
        Ok(None)
    }

    async fn goto_implementation(
        &self,
        scope: Arc<ProjectScope>,
        params: GotoImplementationParams,
    ) -> anyhow::Result<Option<GotoImplementationResponse>> {
        let _ = (scope, params);
        Ok(None)
    }

    async fn references(
        &self,
        scope: Arc<ProjectScope>,
        params: ReferenceParams,
    ) -> anyhow::Result<Option<Vec<Location>>> {
        let _ = (scope, params);
        Ok(None)
    }

    async fn document_highlight(
        &self,
        scope: Arc<ProjectScope>,
        params: DocumentHighlightParams,
    ) -> anyhow::Result<Option<Vec<DocumentHighlight>>> {
        let _ = (scope, params);
        Ok(None)
    }

    async fn document_symbol(
        &self,
        scope: Arc<ProjectScope>,
        params: DocumentSymbolParams,
    ) -> anyhow::Result<Option<DocumentSymbolResponse>> {
        let _ = (scope, params);
        Ok(None)
    }

    async fn workspace_symbol(
        &self,
        params: WorkspaceSymbolParams,
    ) -> anyhow::Result<Option<Vec<SymbolInformation>>> {
        let _ = params;
        Ok(None)
    }

    async fn rename(
        &self,
        scope: Arc<ProjectScope>,
        params: RenameParams,
    ) -> anyhow::Result<Option<WorkspaceEdit>> {
        let _ = (scope, params);
        Ok(None)
    }

    async fn prepare_rename(
        &self,
        scope: Arc<ProjectScope>,
        params: TextDocumentPositionParams,
    ) -> anyhow::Result<Option<PrepareRenameResponse>> {
        let _ = (scope, params);
        Ok(None)
    }

    async fn code_action(
        &self,
        scope: Arc<ProjectScope>,
        params: CodeActionParams,
    ) -> anyhow::Result<Option<CodeActionResponse>> {
        let _ = (scope, params);
        Ok(None)
    }

    async fn inlay_hint(
        &self,
        scope: Arc<ProjectScope>,
        params: InlayHintParams,
    ) -> anyhow::Result<Option<Vec<InlayHint>>> {
        let _ = (scope, params);
        Ok(None)
    }

    async fn semantic_tokens_full(
        &self,
        scope: Arc<ProjectScope>,
        params: SemanticTokensParams,
    ) -> anyhow::Result<Option<SemanticTokensResult>> {
        let _ = (scope, params);
        Ok(None)
    }

    async fn semantic_tokens_range(
        &self,
        scope: Arc<ProjectScope>,
        params: SemanticTokensRangeParams,
    ) -> anyhow::Result<Option<SemanticTokensRangeResult>> {
        let _ = (scope, params);
        Ok(None)
    }

    async fn formatting(
        &self,
        scope: Arc<ProjectScope>,
        params: DocumentFormattingParams,
    ) -> anyhow::Result<Option<Vec<TextEdit>>> {
        let _ = (scope, params);
        Ok(None)
    }

    /// Backs the `groovy/getDecompiledContent` custom request.
    async fn decompiled_content(&self, class_name: &str) -> anyhow::Result<Option<String>> {
        let _ = class_name;
        Ok(None)
    }
}

/// The empty provider set.
pub struct NoProviders;

#[tower_lsp::async_trait]
impl FeatureProviders for NoProviders {}
