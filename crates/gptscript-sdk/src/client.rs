use std::sync::atomic::{AtomicBool, Ordering};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use gptscript_schema::{
    non_empty_env_var, AuthResponse, Credential, Dataset, DatasetElement, DatasetElementMeta,
    DatasetMeta, Document, FileInfo, GlobalOptions, Node, Options, Program, PromptResponse, Tool,
    ToolDef, DEFAULT_CREDENTIAL_CONTEXT, GPTSCRIPT_TOKEN_ENV, GPTSCRIPT_URL_ENV,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::Engine;
use crate::error::GptScriptError;
use crate::handler::EventHandler;
use crate::run::{engine_http_client, Run, ToolPayload};

/// Default workspace for dataset and workspace helpers.
pub const GPTSCRIPT_WORKSPACE_ID_ENV: &str = "GPTSCRIPT_WORKSPACE_ID";

#[derive(Deserialize)]
struct LoadResponse {
    #[serde(default)]
    program: Option<Program>,
}

/// Client for a GPTScript engine.
///
/// Every client holds one reference on its [`Engine`]; call
/// [`GptScript::close`] to give it back. Share a client between tasks (and
/// event handlers) through an `Arc`.
pub struct GptScript {
    opts: GlobalOptions,
    engine: Engine,
    http: reqwest::Client,
    closed: AtomicBool,
}

impl GptScript {
    /// Convenience constructor that connects through [`Engine::global`].
    /// Prefer [`GptScript::with_engine`] when the caller owns the engine's
    /// lifetime.
    pub async fn new(opts: GlobalOptions) -> Result<Self, GptScriptError> {
        Self::with_engine(Engine::global(), opts).await
    }

    /// Connects through `engine`, taking one reference on it. Clients built
    /// from clones of the same handle share one engine server.
    pub async fn with_engine(engine: Engine, mut opts: GlobalOptions) -> Result<Self, GptScriptError> {
        let http = engine_http_client()?;
        if opts.env.is_empty() {
            opts.env = std::env::vars()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
        }

        opts.url = engine.acquire(&opts).await?;
        opts.env.push(format!("{GPTSCRIPT_URL_ENV}={}", opts.url));
        if opts.token.is_empty() {
            opts.token = non_empty_env_var(GPTSCRIPT_TOKEN_ENV).unwrap_or_default();
        }
        if !opts.token.is_empty() {
            opts.env.push(format!("{GPTSCRIPT_TOKEN_ENV}={}", opts.token));
        }
        tracing::debug!(url = %opts.url, "gptscript client connected");

        Ok(Self {
            opts,
            engine,
            http,
            closed: AtomicBool::new(false),
        })
    }

    /// Effective global options, including the resolved engine URL.
    pub fn options(&self) -> &GlobalOptions {
        &self.opts
    }

    /// Releases this client's engine reference. Later calls are no-ops.
    pub async fn close(&self) -> Result<(), GptScriptError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.engine.release().await?;
        Ok(())
    }

    /// Runs inline tool definitions. The first tool is the entry point.
    pub fn evaluate(
        &self,
        tools: impl Into<ToolPayload>,
        opts: Options,
        handlers: Vec<EventHandler>,
    ) -> Result<Run, GptScriptError> {
        let input = opts.input.clone();
        let run = Run::new(
            self.http.clone(),
            "evaluate",
            tools.into(),
            opts.merge_global(&self.opts),
            handlers,
        );
        Ok(run.start(input)?)
    }

    /// Runs the script at `tool_path` (a file path or URL).
    pub fn run(
        &self,
        tool_path: &str,
        opts: Options,
        handlers: Vec<EventHandler>,
    ) -> Result<Run, GptScriptError> {
        let input = opts.input.clone();
        let run = Run::new(
            self.http.clone(),
            "run",
            ToolPayload::from(tool_path),
            opts.merge_global(&self.opts),
            handlers,
        );
        Ok(run.start(input)?)
    }

    pub async fn load_file(
        &self,
        file_path: &str,
        disable_cache: bool,
        sub_tool: &str,
    ) -> Result<Program, GptScriptError> {
        self.load(json!({"file": file_path, "disableCache": disable_cache, "subTool": sub_tool}))
            .await
    }

    pub async fn load_content(
        &self,
        content: &str,
        disable_cache: bool,
        sub_tool: &str,
    ) -> Result<Program, GptScriptError> {
        self.load(json!({"content": content, "disableCache": disable_cache, "subTool": sub_tool}))
            .await
    }

    pub async fn load_tools(
        &self,
        tool_defs: &[ToolDef],
        disable_cache: bool,
        sub_tool: &str,
    ) -> Result<Program, GptScriptError> {
        let tools: Vec<Tool> = tool_defs.iter().cloned().map(Tool::from).collect();
        self.load(json!({"toolDefs": tools, "disableCache": disable_cache, "subTool": sub_tool}))
            .await
    }

    async fn load(&self, body: Value) -> Result<Program, GptScriptError> {
        let response: Option<LoadResponse> = self.basic_json("load", Some(body)).await?;
        Ok(response
            .and_then(|response| response.program)
            .unwrap_or_default())
    }

    pub async fn parse(&self, file_path: &str, disable_cache: bool) -> Result<Vec<Node>, GptScriptError> {
        self.parse_nodes(json!({"file": file_path, "disableCache": disable_cache}))
            .await
    }

    pub async fn parse_content(&self, content: &str) -> Result<Vec<Node>, GptScriptError> {
        self.parse_nodes(json!({"content": content})).await
    }

    async fn parse_nodes(&self, body: Value) -> Result<Vec<Node>, GptScriptError> {
        let document: Option<Document> = self.basic_json("parse", Some(body)).await?;
        Ok(document.map(|document| document.nodes).unwrap_or_default())
    }

    /// Renders nodes back into script text.
    pub async fn fmt(&self, nodes: &[Node]) -> Result<String, GptScriptError> {
        self.basic("fmt", Some(json!({"nodes": nodes}))).await
    }

    /// Answers a `callConfirm` frame.
    pub async fn confirm(&self, response: &AuthResponse) -> Result<(), GptScriptError> {
        self.basic(
            &format!("confirm/{}", response.id),
            Some(serde_json::to_value(response)?),
        )
        .await?;
        Ok(())
    }

    /// Answers a prompt frame.
    pub async fn prompt_response(&self, response: &PromptResponse) -> Result<(), GptScriptError> {
        self.basic(
            &format!("prompt-response/{}", response.id),
            Some(serde_json::to_value(&response.responses)?),
        )
        .await?;
        Ok(())
    }

    pub async fn version(&self) -> Result<String, GptScriptError> {
        self.basic("version", None).await
    }

    /// Lists models from `providers`, plus the configured default model
    /// provider.
    pub async fn list_models(
        &self,
        mut providers: Vec<String>,
        credential_overrides: Vec<String>,
    ) -> Result<Vec<String>, GptScriptError> {
        if !self.opts.default_model_provider.is_empty() {
            providers.push(self.opts.default_model_provider.clone());
        }
        let output = self
            .basic(
                "list-models",
                Some(json!({
                    "providers": providers,
                    "credentialOverrides": credential_overrides,
                })),
            )
            .await?;
        Ok(output
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Lists credentials in `contexts` (the default context when empty).
    pub async fn list_credentials(
        &self,
        contexts: Vec<String>,
        all_contexts: bool,
    ) -> Result<Vec<Credential>, GptScriptError> {
        let credentials: Option<Vec<Credential>> = self
            .basic_json(
                "credentials",
                Some(json!({
                    "context": default_contexts(contexts),
                    "allContexts": all_contexts,
                })),
            )
            .await?;
        Ok(credentials.unwrap_or_default())
    }

    pub async fn create_credential(&self, credential: &Credential) -> Result<String, GptScriptError> {
        self.basic(
            "credentials/create",
            Some(json!({"content": credential.to_content()?})),
        )
        .await
    }

    /// Reveals the credential `name` from the first of `contexts` holding it.
    pub async fn reveal_credential(
        &self,
        contexts: Vec<String>,
        name: &str,
    ) -> Result<Credential, GptScriptError> {
        self.basic_json(
            "credentials/reveal",
            Some(json!({"context": default_contexts(contexts), "name": name})),
        )
        .await
    }

    pub async fn delete_credential(&self, context: &str, name: &str) -> Result<String, GptScriptError> {
        let context = if context.is_empty() {
            DEFAULT_CREDENTIAL_CONTEXT
        } else {
            context
        };
        self.basic(
            "credentials/delete",
            Some(json!({"context": [context], "name": name})),
        )
        .await
    }

    pub async fn list_datasets(&self, workspace_id: &str) -> Result<Vec<DatasetMeta>, GptScriptError> {
        let datasets: Option<Vec<DatasetMeta>> = self
            .basic_json("datasets", Some(self.dataset_body(workspace_id, "{}".to_string())?))
            .await?;
        Ok(datasets.unwrap_or_default())
    }

    pub async fn create_dataset(
        &self,
        workspace_id: &str,
        name: &str,
        description: &str,
    ) -> Result<Dataset, GptScriptError> {
        require_non_empty("name", name)?;
        let input = json!({"datasetName": name, "datasetDescription": description}).to_string();
        self.basic_json("datasets/create", Some(self.dataset_body(workspace_id, input)?))
            .await
    }

    pub async fn add_dataset_element(
        &self,
        workspace_id: &str,
        dataset_id: &str,
        element_name: &str,
        element_content: &str,
        element_description: &str,
    ) -> Result<DatasetElementMeta, GptScriptError> {
        require_non_empty("dataset id", dataset_id)?;
        require_non_empty("element name", element_name)?;
        require_non_empty("element content", element_content)?;
        let input = json!({
            "datasetID": dataset_id,
            "elementName": element_name,
            "elementContent": element_content,
            "elementDescription": element_description,
        })
        .to_string();
        self.basic_json(
            "datasets/add-element",
            Some(self.dataset_body(workspace_id, input)?),
        )
        .await
    }

    pub async fn list_dataset_elements(
        &self,
        workspace_id: &str,
        dataset_id: &str,
    ) -> Result<Vec<DatasetElementMeta>, GptScriptError> {
        require_non_empty("dataset id", dataset_id)?;
        let input = json!({"datasetID": dataset_id}).to_string();
        let elements: Option<Vec<DatasetElementMeta>> = self
            .basic_json(
                "datasets/list-elements",
                Some(self.dataset_body(workspace_id, input)?),
            )
            .await?;
        Ok(elements.unwrap_or_default())
    }

    pub async fn get_dataset_element(
        &self,
        workspace_id: &str,
        dataset_id: &str,
        element_name: &str,
    ) -> Result<DatasetElement, GptScriptError> {
        require_non_empty("dataset id", dataset_id)?;
        require_non_empty("element name", element_name)?;
        let input = json!({"datasetID": dataset_id, "element": element_name}).to_string();
        self.basic_json(
            "datasets/get-element",
            Some(self.dataset_body(workspace_id, input)?),
        )
        .await
    }

    /// Creates a workspace and returns its id.
    pub async fn create_workspace(
        &self,
        provider_type: &str,
        from_workspaces: Vec<String>,
    ) -> Result<String, GptScriptError> {
        self.basic(
            "workspaces/create",
            Some(json!({
                "providerType": provider_type,
                "fromWorkspaces": from_workspaces,
                "workspaceTool": self.opts.workspace_tool,
                "env": self.opts.env,
            })),
        )
        .await
    }

    pub async fn delete_workspace(&self, workspace_id: &str) -> Result<(), GptScriptError> {
        require_non_empty("workspace id", workspace_id)?;
        self.basic(
            "workspaces/delete",
            Some(self.workspace_body(workspace_id, json!({}))),
        )
        .await?;
        Ok(())
    }

    pub async fn list_files_in_workspace(
        &self,
        workspace_id: &str,
        prefix: &str,
    ) -> Result<Vec<String>, GptScriptError> {
        let workspace_id = resolve_workspace_id(workspace_id)?;
        let files: Option<Vec<String>> = self
            .basic_json(
                "workspaces/list",
                Some(self.workspace_body(&workspace_id, json!({"prefix": prefix}))),
            )
            .await?;
        Ok(files.unwrap_or_default())
    }

    pub async fn remove_all(&self, workspace_id: &str, with_prefix: &str) -> Result<(), GptScriptError> {
        let workspace_id = resolve_workspace_id(workspace_id)?;
        self.basic(
            "workspaces/remove-all-with-prefix",
            Some(self.workspace_body(&workspace_id, json!({"prefix": with_prefix}))),
        )
        .await?;
        Ok(())
    }

    pub async fn write_file_in_workspace(
        &self,
        file_path: &str,
        contents: &[u8],
        workspace_id: &str,
    ) -> Result<(), GptScriptError> {
        let workspace_id = resolve_workspace_id(workspace_id)?;
        self.basic(
            "workspaces/write-file",
            Some(self.workspace_body(
                &workspace_id,
                json!({"filePath": file_path, "contents": STANDARD.encode(contents)}),
            )),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_file_in_workspace(
        &self,
        file_path: &str,
        workspace_id: &str,
    ) -> Result<(), GptScriptError> {
        let workspace_id = resolve_workspace_id(workspace_id)?;
        self.basic(
            "workspaces/delete-file",
            Some(self.workspace_body(&workspace_id, json!({"filePath": file_path}))),
        )
        .await?;
        Ok(())
    }

    pub async fn read_file_in_workspace(
        &self,
        file_path: &str,
        workspace_id: &str,
    ) -> Result<Vec<u8>, GptScriptError> {
        let workspace_id = resolve_workspace_id(workspace_id)?;
        let encoded = self
            .basic(
                "workspaces/read-file",
                Some(self.workspace_body(&workspace_id, json!({"filePath": file_path}))),
            )
            .await?;
        Ok(STANDARD.decode(encoded.trim())?)
    }

    pub async fn stat_file_in_workspace(
        &self,
        file_path: &str,
        workspace_id: &str,
    ) -> Result<FileInfo, GptScriptError> {
        let workspace_id = resolve_workspace_id(workspace_id)?;
        self.basic_json(
            "workspaces/stat-file",
            Some(self.workspace_body(&workspace_id, json!({"filePath": file_path}))),
        )
        .await
    }

    fn dataset_body(&self, workspace_id: &str, input: String) -> Result<Value, GptScriptError> {
        Ok(json!({
            "input": input,
            "workspaceID": resolve_workspace_id(workspace_id)?,
            "datasetToolRepo": self.opts.dataset_tool_repo,
            "env": self.opts.env,
        }))
    }

    fn workspace_body(&self, workspace_id: &str, extra: Value) -> Value {
        let mut body = json!({
            "id": workspace_id,
            "workspaceTool": self.opts.workspace_tool,
            "env": self.opts.env,
        });
        if let (Value::Object(body), Value::Object(extra)) = (&mut body, extra) {
            body.extend(extra);
        }
        body
    }

    async fn basic(&self, sub_command: &str, body: Option<Value>) -> Result<String, GptScriptError> {
        let run = Run::basic(
            self.http.clone(),
            sub_command,
            body,
            &self.opts.url,
            &self.opts.token,
        );
        let mut run = run.start("")?;
        Ok(run.text().await?)
    }

    async fn basic_json<T: DeserializeOwned>(
        &self,
        sub_command: &str,
        body: Option<Value>,
    ) -> Result<T, GptScriptError> {
        let output = self.basic(sub_command, body).await?;
        Ok(serde_json::from_str(&output)?)
    }
}

fn default_contexts(contexts: Vec<String>) -> Vec<String> {
    if contexts.is_empty() {
        vec![DEFAULT_CREDENTIAL_CONTEXT.to_string()]
    } else {
        contexts
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), GptScriptError> {
    if value.is_empty() {
        return Err(GptScriptError::InvalidArgument(format!("{field} cannot be empty")));
    }
    Ok(())
}

fn resolve_workspace_id(workspace_id: &str) -> Result<String, GptScriptError> {
    if !workspace_id.is_empty() {
        return Ok(workspace_id.to_string());
    }
    non_empty_env_var(GPTSCRIPT_WORKSPACE_ID_ENV).ok_or_else(|| {
        GptScriptError::InvalidArgument(format!(
            "workspace id is empty and {GPTSCRIPT_WORKSPACE_ID_ENV} is not set"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::{default_contexts, require_non_empty};
    use crate::error::GptScriptError;

    #[test]
    fn unit_credential_contexts_default_to_the_default_context() {
        assert_eq!(default_contexts(Vec::new()), vec!["default"]);
        assert_eq!(
            default_contexts(vec!["work".to_string()]),
            vec!["work".to_string()]
        );
    }

    #[test]
    fn unit_empty_required_arguments_are_rejected() {
        let error = require_non_empty("dataset id", "").expect_err("empty id");
        assert!(matches!(error, GptScriptError::InvalidArgument(ref message) if message == "dataset id cannot be empty"));
        assert!(require_non_empty("dataset id", "ds-1").is_ok());
    }
}
