use std::path::PathBuf;

/// TCP port the engine daemon listens on for shell connections.
pub const ENGINE_TCP_PORT: u16 = 9877;

/// One mpv process runs per mounted player, so sockets are per instance.
#[cfg(unix)]
pub fn mpv_socket_name(instance: &str) -> String {
    format!(
        "{}/livecast-mpv-{}.sock",
        std::env::temp_dir().display(),
        instance
    )
}

#[cfg(windows)]
pub fn mpv_socket_name(instance: &str) -> String {
    format!("livecast-mpv-{}", instance)
}

#[cfg(unix)]
pub fn mpv_socket_arg(instance: &str) -> String {
    format!("--input-ipc-server={}", mpv_socket_name(instance))
}

#[cfg(windows)]
pub fn mpv_socket_arg(instance: &str) -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", mpv_socket_name(instance))
}

pub fn data_dir() -> PathBuf {
    // XDG layout on every unix, including macOS
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("livecast")
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("livecast")
    }
}

pub fn config_dir() -> PathBuf {
    // LIVECAST_CONFIG_DIR wins so previews can run side by side
    if let Ok(dir) = std::env::var("LIVECAST_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("livecast")
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("livecast")
    }
}

#[cfg(unix)]
pub fn mpv_binary_name() -> &'static str {
    "mpv"
}

#[cfg(windows)]
pub fn mpv_binary_name() -> &'static str {
    "mpv.exe"
}

fn find_beside_exe(name: &str) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let dir = current_exe.parent()?;
    let p = dir.join(name);
    if p.exists() {
        return Some(p);
    }
    let p = dir.join("external").join(name);
    if p.exists() {
        return Some(p);
    }
    None
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var("PATH").ok()?;
    #[cfg(unix)]
    let sep = ":";
    #[cfg(windows)]
    let sep = ";";
    path.split(sep)
        .map(|dir| PathBuf::from(dir).join(name))
        .find(|p| p.exists())
}

/// Find the mpv binary used by the segmented, legacy and low-latency players.
/// Checks `MPV_PATH`, then beside the current exe, then PATH.
pub fn find_mpv_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("MPV_PATH") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }

    find_beside_exe(mpv_binary_name()).or_else(|| find_on_path(mpv_binary_name()))
}
