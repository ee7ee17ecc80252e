//! Provider strategies: how each external agent CLI is invoked.
//!
//! A provider turns a prompt into a structured [`Invocation`]
//! (`executable` + argument vector + optional stdin). Nothing is ever passed
//! through a shell, so task text containing quotes, backticks or `$()` reaches
//! the agent verbatim.
//!
//! Built-in providers are registered explicitly in [`ProviderRegistry::builtin`].
//! User providers come from `[providers.<name>]` tables in `ralph.toml` and are
//! validated by [`ProviderSpec::from_definition`] before use. A user definition
//! replaces a built-in of the same name wholesale; fields are never merged.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const PROMPT_TOKEN: &str = "{prompt}";
const FILES_TOKEN: &str = "{files}";
const MODEL_TOKEN: &str = "{model}";
const DEFAULT_MODEL_FLAG: &str = "--model";

/// Concrete process invocation produced by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub executable: String,
    pub args: Vec<String>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
}

/// Per-call inputs for [`ProviderSpec::build`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildContext<'a> {
    /// Already-resolved model; `None` omits the model flag.
    pub model: Option<&'a str>,
    pub files: &'a [String],
}

/// How the prompt reaches the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptDelivery {
    /// As the `{prompt}` argument.
    #[default]
    Argument,
    /// On stdin; avoids OS argument-length limits for large prompts.
    Stdin,
}

/// User-supplied provider definition (`[providers.<name>]` in `ralph.toml`).
///
/// `args` entries are literal arguments, except for the whole-argument
/// placeholders `{prompt}`, `{files}` (expands to one argument per affected
/// file) and `{model}` (expands to `model_flag <model>` when a model resolves,
/// and to nothing otherwise).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderDefinition {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub prompt: PromptDelivery,
    #[serde(default = "default_model_flag")]
    pub model_flag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// Replace a prompt that names an existing file with the file's content.
    #[serde(default = "default_read_prompt_file")]
    pub read_prompt_file: bool,
}

fn default_model_flag() -> String {
    DEFAULT_MODEL_FLAG.to_string()
}

fn default_read_prompt_file() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ArgPart {
    Literal(String),
    Prompt,
    Files,
    Model,
}

/// Validated, immutable provider descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSpec {
    name: String,
    executable: String,
    args: Vec<ArgPart>,
    prompt: PromptDelivery,
    model_flag: String,
    default_model: Option<String>,
    read_prompt_file: bool,
}

impl ProviderSpec {
    /// Validate a user definition.
    pub fn from_definition(name: &str, def: &ProviderDefinition) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            bail!("provider name must not be empty");
        }
        let executable = def.executable.trim();
        if executable.is_empty() {
            bail!("provider {name}: executable must not be empty");
        }

        let args = def
            .args
            .iter()
            .map(|arg| parse_arg(arg))
            .collect::<Result<Vec<_>>>()
            .map_err(|err| anyhow!("provider {name}: {err}"))?;

        let count = |part: &ArgPart| args.iter().filter(|a| *a == part).count();
        let prompt_args = count(&ArgPart::Prompt);
        match def.prompt {
            PromptDelivery::Argument if prompt_args != 1 => {
                bail!("provider {name}: args must contain {PROMPT_TOKEN} exactly once");
            }
            PromptDelivery::Stdin if prompt_args != 0 => {
                bail!("provider {name}: {PROMPT_TOKEN} is not allowed with prompt = \"stdin\"");
            }
            _ => {}
        }
        if count(&ArgPart::Files) > 1 {
            bail!("provider {name}: {FILES_TOKEN} may appear at most once");
        }
        if count(&ArgPart::Model) > 1 {
            bail!("provider {name}: {MODEL_TOKEN} may appear at most once");
        }
        if count(&ArgPart::Model) == 1 && def.model_flag.trim().is_empty() {
            bail!("provider {name}: model_flag must not be empty when {MODEL_TOKEN} is used");
        }

        Ok(Self {
            name: name.to_string(),
            executable: executable.to_string(),
            args,
            prompt: def.prompt,
            model_flag: def.model_flag.trim().to_string(),
            default_model: non_empty(def.default_model.as_deref()),
            read_prompt_file: def.read_prompt_file,
        })
    }

    fn builtin(name: &str, executable: &str, args: Vec<ArgPart>, prompt: PromptDelivery) -> Self {
        Self {
            name: name.to_string(),
            executable: executable.to_string(),
            args,
            prompt,
            model_flag: DEFAULT_MODEL_FLAG.to_string(),
            default_model: None,
            read_prompt_file: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    /// Translate a prompt (or the path of a context file) into an invocation.
    pub fn build(&self, prompt: &str, ctx: &BuildContext<'_>) -> Invocation {
        let text = self.resolve_prompt(prompt);
        let mut args = Vec::with_capacity(self.args.len() + ctx.files.len() + 2);
        for part in &self.args {
            match part {
                ArgPart::Literal(arg) => args.push(arg.clone()),
                ArgPart::Prompt => args.push(text.to_string()),
                ArgPart::Files => args.extend(ctx.files.iter().cloned()),
                ArgPart::Model => {
                    if let Some(model) = ctx.model {
                        args.push(self.model_flag.clone());
                        args.push(model.to_string());
                    }
                }
            }
        }
        let stdin = (self.prompt == PromptDelivery::Stdin).then(|| text.into_owned());
        Invocation {
            executable: self.executable.clone(),
            args,
            stdin,
        }
    }

    fn resolve_prompt<'a>(&self, prompt: &'a str) -> Cow<'a, str> {
        if !self.read_prompt_file || !Path::new(prompt).is_file() {
            return Cow::Borrowed(prompt);
        }
        match fs::read_to_string(prompt) {
            Ok(contents) => {
                debug!(provider = %self.name, path = prompt, "using context file content as prompt");
                Cow::Owned(contents)
            }
            Err(err) => {
                warn!(provider = %self.name, path = prompt, err = %err, "failed to read context file, passing path");
                Cow::Borrowed(prompt)
            }
        }
    }
}

fn parse_arg(arg: &str) -> Result<ArgPart> {
    match arg {
        PROMPT_TOKEN => Ok(ArgPart::Prompt),
        FILES_TOKEN => Ok(ArgPart::Files),
        MODEL_TOKEN => Ok(ArgPart::Model),
        _ if [PROMPT_TOKEN, FILES_TOKEN, MODEL_TOKEN]
            .iter()
            .any(|token| arg.contains(token)) =>
        {
            bail!("placeholders must be whole arguments (got '{arg}')")
        }
        _ if arg.starts_with('{') && arg.ends_with('}') => {
            bail!("unknown placeholder '{arg}'")
        }
        _ => Ok(ArgPart::Literal(arg.to_string())),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn lit(arg: &str) -> ArgPart {
    ArgPart::Literal(arg.to_string())
}

/// Name-keyed provider table.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, ProviderSpec>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in provider.
    pub fn builtin() -> Self {
        use ArgPart::{Files, Model, Prompt};
        use PromptDelivery::{Argument, Stdin};

        let mut registry = Self::empty();
        registry.register(ProviderSpec::builtin(
            "gemini",
            "gemini",
            vec![Model, lit("--yolo")],
            Stdin,
        ));
        registry.register(ProviderSpec::builtin(
            "aider",
            "aider",
            vec![lit("--message"), Prompt, Files, Model],
            Argument,
        ));
        registry.register(ProviderSpec::builtin(
            "cline",
            "cline",
            vec![Prompt, lit("--oneshot"), lit("--yolo")],
            Argument,
        ));
        registry.register(ProviderSpec::builtin(
            "forge",
            "forge",
            vec![lit("--prompt"), Prompt],
            Argument,
        ));
        registry.register(ProviderSpec::builtin(
            "github-copilot",
            "copilot",
            vec![lit("--allow-all-tools"), lit("--prompt"), Prompt],
            Argument,
        ));
        registry.register(ProviderSpec::builtin(
            "opencode",
            "opencode",
            vec![Prompt],
            Argument,
        ));
        registry.register(ProviderSpec::builtin(
            "nanocoder",
            "nanocoder",
            vec![Prompt],
            Argument,
        ));
        registry.register(ProviderSpec::builtin(
            "qwen",
            "qwen",
            vec![lit("--yolo"), Prompt],
            Argument,
        ));
        registry
    }

    /// Built-ins overlaid with validated user definitions.
    pub fn with_definitions(definitions: &BTreeMap<String, ProviderDefinition>) -> Result<Self> {
        let mut registry = Self::builtin();
        for (name, def) in definitions {
            let spec = ProviderSpec::from_definition(name, def)?;
            if registry.register(spec).is_some() {
                debug!(provider = %name, "user definition replaces built-in provider");
            }
        }
        Ok(registry)
    }

    /// Insert a provider, returning the one it replaced.
    pub fn register(&mut self, spec: ProviderSpec) -> Option<ProviderSpec> {
        self.providers.insert(spec.name.clone(), spec)
    }

    pub fn get(&self, name: &str) -> Option<&ProviderSpec> {
        self.providers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}
