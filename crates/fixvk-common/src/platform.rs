use std::path::PathBuf;

/// Returns the platform name string.
pub fn platform_name() -> &'static str {
    #[cfg(target_os = "windows")]
    { "windows" }
    #[cfg(target_os = "linux")]
    { "linux" }
    #[cfg(target_os = "macos")]
    { "macos" }
    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    { "unknown" }
}

/// Directory holding the system-wide configuration file.
pub fn system_config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        let programdata = std::env::var("PROGRAMDATA")
            .unwrap_or_else(|_| r"C:\ProgramData".to_string());
        PathBuf::from(programdata).join("fixvk")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/etc/fixvk")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_name_is_known_string() {
        assert!(!platform_name().is_empty());
    }

    #[test]
    fn test_system_config_dir_ends_with_project_name() {
        assert!(system_config_dir().ends_with("fixvk"));
    }
}
