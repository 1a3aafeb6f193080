use crate::error::StmbError;
use crate::stmb::config::StmbConfig;
use crate::stmb::host::{ChatMetadata, Host};
use crate::stmb::lorebook::Lorebook;

/// Lorebook the chat writes memories to, without creating anything.
pub fn effective_lorebook_name(cfg: &StmbConfig, meta: &ChatMetadata) -> Option<String> {
    let name = if cfg.auto_summary.manual_mode_enabled {
        meta.manual_lorebook.as_deref()
    } else {
        meta.bound_lorebook.as_deref()
    };
    name.map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

/// `LTM - {{char}} - {{chat}}` style names. Path separators become `-`.
pub fn render_lorebook_name(template: &str, character: &str, user: &str, chat: &str) -> String {
    template
        .replace("{{char}}", character)
        .replace("{{user}}", user)
        .replace("{{chat}}", chat)
        .replace(['/', '\\'], "-")
        .trim()
        .to_string()
}

/// Create (or reuse) the templated lorebook and bind it to the chat.
/// The caller saves `meta`.
pub fn auto_create_lorebook(
    cfg: &StmbConfig,
    host: &Host<'_>,
    meta: &mut ChatMetadata,
) -> Result<String, StmbError> {
    let name = render_lorebook_name(
        &cfg.auto_summary.lorebook_name_template,
        &host.transcript.character_name(),
        &host.transcript.user_name(),
        &host.transcript.chat_name(),
    );
    if name.is_empty() {
        return Err(StmbError::Lorebook(
            "lorebook name template rendered to an empty name".to_string(),
        ));
    }
    if !host.lorebooks.exists(&name) {
        host.lorebooks
            .save(&name, &Lorebook::default())
            .map_err(|err| StmbError::Lorebook(format!("failed to create lorebook {name:?}: {err:#}")))?;
        tracing::info!(lorebook = %name, "created memory lorebook");
    }
    meta.bound_lorebook = Some(name.clone());
    Ok(name)
}

fn load_named(host: &Host<'_>, name: &str) -> Result<Lorebook, StmbError> {
    if !host.lorebooks.exists(name) {
        return Err(StmbError::Lorebook(format!(
            "selected lorebook \"{name}\" not found"
        )));
    }
    host.lorebooks
        .load(name)
        .map_err(|err| StmbError::Lorebook(format!("failed to load lorebook {name:?}: {err:#}")))
}

/// Memory destination. Auto-creates when allowed and nothing is bound.
pub fn resolve_for_memory(
    cfg: &StmbConfig,
    host: &Host<'_>,
    meta: &mut ChatMetadata,
) -> Result<(String, Lorebook), StmbError> {
    let name = match effective_lorebook_name(cfg, meta) {
        Some(name) => name,
        None if cfg.auto_summary.auto_create_lorebook && !cfg.auto_summary.manual_mode_enabled => {
            let name = auto_create_lorebook(cfg, host, meta)?;
            host.metadata.save(meta).map_err(StmbError::Other)?;
            name
        }
        None => {
            return Err(StmbError::Lorebook(
                "no lorebook available or selected; bind one to the chat first".to_string(),
            ));
        }
    };
    let book = load_named(host, &name)?;
    Ok((name, book))
}

/// Side-prompt destination: never creates, never asks.
pub fn require_strict(
    cfg: &StmbConfig,
    host: &Host<'_>,
    meta: &ChatMetadata,
) -> Result<(String, Lorebook), StmbError> {
    let name = effective_lorebook_name(cfg, meta).ok_or_else(|| {
        StmbError::Lorebook("no memory lorebook is assigned to this chat".to_string())
    })?;
    let book = load_named(host, &name)?;
    Ok((name, book))
}
