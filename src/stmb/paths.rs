use anyhow::Result;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct StmbPaths {
    pub stmb_home: PathBuf,
    pub chats_dir: PathBuf,
    pub lorebooks_dir: PathBuf,
    pub side_prompts_file: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl StmbPaths {
    pub fn from_home(stmb_home: PathBuf) -> Self {
        Self {
            chats_dir: stmb_home.join("chats"),
            lorebooks_dir: stmb_home.join("lorebooks"),
            side_prompts_file: stmb_home.join("side_prompts.json"),
            state_dir: stmb_home.join("state"),
            logs_dir: stmb_home.join("logs"),
            stmb_home,
        }
    }

    pub fn chat_dir(&self, chat: &str) -> PathBuf {
        self.chats_dir.join(chat)
    }
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_paths() -> Result<StmbPaths> {
    let stmb_home = match env::var("STMB_HOME") {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => required_home_dir()?.join("STMB"),
    };

    let mut paths = StmbPaths::from_home(stmb_home);
    paths.lorebooks_dir = env_or_default_path("STMB_LOREBOOKS_DIR", paths.lorebooks_dir);
    paths.logs_dir = env_or_default_path("STMB_LOGS_DIR", paths.logs_dir);
    Ok(paths)
}
