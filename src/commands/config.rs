use owo_colors::OwoColorize;

use crate::config::{
    EnvSnapshot, config_file_path, config_warnings, init_config_toml, list_models, load_config,
    lookup_model,
};
use crate::sanitize::mask_secret;
use crate::{CliError, CliResult, ConfigCommand};

pub async fn handle_config_cmd(cmd: ConfigCommand) -> CliResult<()> {
    match cmd {
        ConfigCommand::Path => {
            println!("{}", config_file_path().display());
        }
        ConfigCommand::Init { force } => {
            let path = init_config_toml(force)
                .await
                .map_err(|e| CliError::ProxyConfig(e.to_string()))?;
            println!("Wrote TOML config template to {:?}", path);
        }
        ConfigCommand::Show => {
            let cfg = load_config()
                .await
                .map_err(|e| CliError::ProxyConfig(e.to_string()))?;
            let text = toml::to_string_pretty(&cfg.masked())
                .map_err(|e| CliError::ProxyConfig(e.to_string()))?;
            println!("# {}", config_file_path().display());
            println!("{text}");
        }
    }
    Ok(())
}

/// Print every model name the bridge would accept, where it resolves from and how.
pub async fn handle_models_cmd(env: &EnvSnapshot) -> CliResult<()> {
    let cfg = load_config()
        .await
        .map_err(|e| CliError::ProxyConfig(e.to_string()))?;
    let models = list_models(env, &cfg);
    if models.is_empty() {
        println!(
            "No models configured. Set AZURE_OPENAI_* variables or edit {:?}",
            config_file_path()
        );
        return Ok(());
    }

    println!("Configured models:");
    for m in models {
        let detail = lookup_model(&m.id, env, &cfg)
            .map(|(_, entry)| {
                let deployment = entry.deployment.unwrap_or_else(|| "-".to_string());
                let key = entry
                    .api_key
                    .as_deref()
                    .map(mask_secret)
                    .or_else(|| entry.api_key_env.map(|name| format!("${name}")))
                    .unwrap_or_else(|| "-".to_string());
                format!("deployment={deployment} key={key}")
            })
            .unwrap_or_default();
        println!(
            "  {:<24} {:<9} {:<24} {}",
            m.id,
            m.mode.as_str(),
            m.source.as_str(),
            detail
        );
    }

    let warnings = config_warnings(env, &cfg);
    if !warnings.is_empty() {
        println!();
        for w in warnings {
            println!("{}", format!("warning: {w}").yellow());
        }
    }
    Ok(())
}
