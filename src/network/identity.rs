//! Persistent node identity

use anyhow::Result;
use libp2p::identity::{ed25519, Keypair};
use std::path::Path;
use tracing::{info, warn};

/// Raw ed25519 keypair encoding: 32-byte secret seed followed by the public key
const KEYPAIR_LEN: usize = 64;

/// Load the node keypair from `path`, or generate and persist a new one.
///
/// The file holds the raw 64 keypair bytes. A file of any other length, or one
/// that does not decode, is replaced with a fresh key.
pub fn load_or_generate_keypair(path: &Path) -> Result<Keypair> {
    if path.exists() {
        let mut bytes = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read keypair from {}: {}", path.display(), e))?;
        if bytes.len() == KEYPAIR_LEN {
            match ed25519::Keypair::try_from_bytes(&mut bytes) {
                Ok(keypair) => {
                    info!("Loaded node keypair from {}", path.display());
                    return Ok(Keypair::from(keypair));
                }
                Err(e) => warn!("Key file {} does not decode ({}), regenerating", path.display(), e),
            }
        } else {
            warn!(
                "Key file {} has {} bytes, expected {}; regenerating",
                path.display(),
                bytes.len(),
                KEYPAIR_LEN
            );
        }
    }

    let keypair = ed25519::Keypair::generate();
    write_key_file(path, &keypair.to_bytes())?;
    info!("Generated new node keypair, saved to {}", path.display());
    Ok(Keypair::from(keypair))
}

fn write_key_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| anyhow::anyhow!("Failed to create key directory {}: {}", parent.display(), e))?;
    }
    std::fs::write(path, bytes)
        .map_err(|e| anyhow::anyhow!("Failed to write keypair to {}: {}", path.display(), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::PeerId;

    #[test]
    fn test_identity_is_stable_across_loads() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("peerkey.bin");

        let first = load_or_generate_keypair(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap().len(), KEYPAIR_LEN);

        let second = load_or_generate_keypair(&path).unwrap();
        assert_eq!(PeerId::from(first.public()), PeerId::from(second.public()));
    }

    #[test]
    fn test_wrong_length_key_file_is_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("peerkey.bin");
        std::fs::write(&path, b"short").unwrap();

        let keypair = load_or_generate_keypair(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), KEYPAIR_LEN);

        let reloaded = load_or_generate_keypair(&path).unwrap();
        assert_eq!(PeerId::from(keypair.public()), PeerId::from(reloaded.public()));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("peerkey.bin");
        load_or_generate_keypair(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
