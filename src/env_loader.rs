use std::env;
use std::path::PathBuf;

fn fallback_dotenv_path(stmb_home: Option<PathBuf>, home_dir: Option<PathBuf>) -> Option<PathBuf> {
    match (stmb_home, home_dir) {
        (Some(stmb_home), _) => Some(stmb_home.join(".env")),
        (None, Some(home)) => Some(home.join("STMB/.env")),
        (None, None) => None,
    }
}

pub fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let fallback = fallback_dotenv_path(
        env::var_os("STMB_HOME").map(PathBuf::from),
        dirs::home_dir(),
    );

    let Some(path) = fallback else {
        return;
    };
    if path.is_file() {
        let _ = dotenvy::from_path(&path);
    }
}
