//! CSI endpoint handling

use crate::error::{Error, Result};
use crate::hardware::mount::ensure_dir;
use std::path::{Path, PathBuf};
use tracing::info;

const UNIX_SCHEME: &str = "unix://";

/// Socket path of a `unix://` endpoint URI
pub fn parse_endpoint(endpoint: &str) -> Result<PathBuf> {
    let path = endpoint.strip_prefix(UNIX_SCHEME).ok_or_else(|| {
        Error::InvalidArgument(format!("unsupported endpoint scheme: {endpoint}"))
    })?;
    if path.is_empty() {
        return Err(Error::InvalidArgument(format!("empty socket path: {endpoint}")));
    }
    Ok(PathBuf::from(path))
}

/// Make `socket` bindable: drop a stale socket file and create its parent
pub fn prepare_socket(socket: &Path) -> Result<()> {
    if let Some(parent) = socket.parent() {
        ensure_dir(parent)?;
    }
    match std::fs::remove_file(socket) {
        Ok(()) => {
            info!(socket = %socket.display(), "removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("unix:///csi/csi.sock").unwrap(),
            PathBuf::from("/csi/csi.sock")
        );
        assert_matches!(
            parse_endpoint("tcp://127.0.0.1:10000"),
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(parse_endpoint("unix://"), Err(Error::InvalidArgument(_)));
    }

    #[test]
    fn test_prepare_removes_stale_socket() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join("plugins/directpv-min-io/csi.sock");

        tokio_test::assert_ok!(prepare_socket(&socket));
        assert!(socket.parent().unwrap().is_dir());

        std::fs::write(&socket, b"").unwrap();
        tokio_test::assert_ok!(prepare_socket(&socket));
        assert!(!socket.exists());
    }
}
