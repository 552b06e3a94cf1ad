use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::Local;
use log::{info, warn};

/// Replaces every non-alphanumeric character so the value is safe inside
/// a file name.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

fn artifact_path(dir: &str, account_name: &str, context: &str, extension: &str) -> PathBuf {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let file_name = format!(
        "{}_{}_{}.{}",
        sanitize_name(account_name),
        timestamp,
        sanitize_name(context),
        extension
    );
    PathBuf::from(dir).join(file_name)
}

/// Saves a diagnostic text artifact (HTML body, invalid response) under
/// `logs/` for post-hoc inspection. Failures are logged, never fatal.
pub fn save_text_artifact(account_name: &str, context: &str, extension: &str, content: &str) {
    let dir = "logs";
    if let Err(e) = fs::create_dir_all(dir) {
        warn!("{}: failed to create {} directory: {}", account_name, dir, e);
        return;
    }
    let path = artifact_path(dir, account_name, context, extension);
    match fs::File::create(&path).and_then(|mut f| f.write_all(content.as_bytes())) {
        Ok(()) => info!("{}: saved response body to {}", account_name, path.display()),
        Err(e) => warn!("{}: failed to save artifact: {}", account_name, e),
    }
}

/// Path for a page screenshot under `screenshots/`; the directory is
/// created on demand.
pub fn screenshot_path(account_name: &str, reason: &str) -> Option<PathBuf> {
    let dir = "screenshots";
    if let Err(e) = fs::create_dir_all(dir) {
        warn!("{}: failed to create {} directory: {}", account_name, dir, e);
        return None;
    }
    Some(artifact_path(dir, account_name, reason, "png"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_account_names_for_file_use() {
        assert_eq!(sanitize_name("my account #1"), "my_account__1");
        assert_eq!(sanitize_name("plain"), "plain");
    }
}
