use anyhow::{bail, Result};
use std::{
    env,
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    process::Command,
    sync::OnceLock,
    thread,
    time::{Duration, Instant},
};

const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Ensure a container runtime socket is available for testcontainers.
///
/// testcontainers talks to the Docker API; when only Podman is present we
/// point `DOCKER_HOST` at the Podman socket.
///
/// # Errors
/// Returns an error if no Docker/Podman socket can be found or reached.
pub fn ensure_container_runtime() -> Result<()> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();
    match INIT.get_or_init(init_container_runtime) {
        Ok(()) => Ok(()),
        Err(message) => bail!("{message}"),
    }
}

fn init_container_runtime() -> Result<(), String> {
    if let Ok(docker_host) = env::var("DOCKER_HOST") {
        return validate_docker_host(&docker_host);
    }

    let docker_socket = Path::new("/var/run/docker.sock");
    if wait_for_socket(docker_socket, SOCKET_WAIT_TIMEOUT) {
        return Ok(());
    }

    if let Some(path) = find_podman_socket() {
        if wait_for_socket(&path, SOCKET_WAIT_TIMEOUT) {
            set_docker_host(&path);
            return Ok(());
        }
        let mut message = format!(
            "Podman socket found at `{}`, but it is not accepting connections.",
            path.display()
        );
        if let Some(err) = runtime_info_error("podman") {
            message.push_str(&format!(" podman info error: {err}"));
        }
        return Err(message);
    }

    let mut message = "No container runtime socket found or reachable. Start the Docker daemon, run `podman system service`, or set `DOCKER_HOST`.".to_string();
    if docker_socket.exists() {
        if let Some(err) = runtime_info_error("docker") {
            message.push_str(&format!(" docker info error: {err}"));
        }
    }
    Err(message)
}

fn find_podman_socket() -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        candidates.push(PathBuf::from(runtime_dir).join("podman/podman.sock"));
    }
    candidates.push(PathBuf::from("/var/run/podman/podman.sock"));
    candidates.push(PathBuf::from("/run/podman/podman.sock"));

    candidates.into_iter().find(|path| path.exists())
}

fn validate_docker_host(docker_host: &str) -> Result<(), String> {
    let path = docker_host
        .strip_prefix("unix://")
        .or_else(|| docker_host.starts_with('/').then_some(docker_host));

    // TCP hosts are handed to testcontainers as-is.
    let Some(path) = path else {
        return Ok(());
    };

    if wait_for_socket(Path::new(path), SOCKET_WAIT_TIMEOUT) {
        return Ok(());
    }
    Err(format!(
        "`DOCKER_HOST` points to `{docker_host}`, but the socket is not accepting connections."
    ))
}

fn socket_connectable(path: &Path) -> bool {
    path.exists() && UnixStream::connect(path).is_ok()
}

fn wait_for_socket(path: &Path, timeout: Duration) -> bool {
    if !path.exists() {
        return false;
    }
    let start = Instant::now();
    while start.elapsed() < timeout {
        if socket_connectable(path) {
            return true;
        }
        thread::sleep(Duration::from_millis(200));
    }
    false
}

fn runtime_info_error(binary: &str) -> Option<String> {
    let output = match Command::new(binary).arg("info").output() {
        Ok(output) => output,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => return Some(err.to_string()),
    };

    if output.status.success() {
        return None;
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        Some(format!("{binary} info exited with {}", output.status))
    } else {
        Some(stderr)
    }
}

fn set_docker_host(path: &Path) {
    let docker_host = format!("unix://{}", path.display());
    // SAFETY: set once during test setup, before any container is started.
    #[allow(unused_unsafe)]
    unsafe {
        env::set_var("DOCKER_HOST", docker_host);
    }
}
