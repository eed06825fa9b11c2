use std::path::PathBuf;
use std::sync::OnceLock;

static GRAB_HOME: OnceLock<Option<PathBuf>> = OnceLock::new();

/// Store the grab home override from the CLI flag.
/// Falls through to `GRAB_HOME` env var if `None`.
pub fn init(grab_home: Option<PathBuf>) {
    let _ = GRAB_HOME.set(grab_home);
}

fn grab_home() -> Option<PathBuf> {
    GRAB_HOME.get().and_then(|p| p.clone()).or_else(|| {
        std::env::var("GRAB_HOME")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    })
}

pub fn data_dir() -> Result<PathBuf, anyhow::Error> {
    if let Some(gp) = grab_home() {
        return Ok(gp.join("data"));
    }

    let base = match std::env::var("XDG_DATA_HOME") {
        Ok(val) if !val.is_empty() => PathBuf::from(val),
        _ => {
            let home = dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("could not determine home directory"))?;
            home.join(".local").join("share")
        }
    };

    Ok(base.join("grab"))
}

pub fn runtime_dir() -> Result<PathBuf, anyhow::Error> {
    if let Some(gp) = grab_home() {
        return Ok(gp.join("runtime"));
    }

    let base = match std::env::var("XDG_RUNTIME_DIR") {
        Ok(val) if !val.is_empty() => PathBuf::from(val),
        _ => std::env::temp_dir(),
    };

    Ok(base.join("grab"))
}

pub fn config_dir() -> Result<PathBuf, anyhow::Error> {
    if let Some(gp) = grab_home() {
        return Ok(gp.join("config"));
    }

    let base = match std::env::var("XDG_CONFIG_HOME") {
        Ok(val) if !val.is_empty() => PathBuf::from(val),
        _ => {
            let home = dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("could not determine home directory"))?;
            home.join(".config")
        }
    };

    Ok(base.join("grab"))
}

pub fn state_dir() -> Result<PathBuf, anyhow::Error> {
    if let Some(gp) = grab_home() {
        return Ok(gp.join("state"));
    }

    let base = match std::env::var("XDG_STATE_HOME") {
        Ok(val) if !val.is_empty() => PathBuf::from(val),
        _ => {
            let home = dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("could not determine home directory"))?;
            home.join(".local").join("state")
        }
    };

    Ok(base.join("grab"))
}

pub fn database_path() -> Result<PathBuf, anyhow::Error> {
    Ok(data_dir()?.join("jobs.sqlite3"))
}

/// Default directory for finished downloads; overridable via config.
pub fn download_dir() -> Result<PathBuf, anyhow::Error> {
    Ok(data_dir()?.join("finished"))
}

pub fn ensure_dirs() -> Result<(), anyhow::Error> {
    let data = data_dir()?;
    tracing::debug!(path = %data.display(), "ensuring data directory");
    std::fs::create_dir_all(data)?;

    let runtime = runtime_dir()?;
    tracing::debug!(path = %runtime.display(), "ensuring runtime directory");
    std::fs::create_dir_all(runtime)?;

    let state = state_dir()?;
    tracing::debug!(path = %state.display(), "ensuring state directory");
    std::fs::create_dir_all(state)?;

    Ok(())
}
