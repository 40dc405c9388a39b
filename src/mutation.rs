//! Rebuild triggers
//!
//! A [`ChangeTrigger`] prepares a change up front and hands back a
//! [`Commit`] that applies it. Preparation (reading the file, generating
//! content) happens before the timer starts; only the commit is measured.

use std::path::Path;

use async_trait::async_trait;
use devprof_core::{ProfileError, ProfileResult};
use futures::future::BoxFuture;
use tracing::trace;

/// Deferred action that applies a prepared change. Nothing happens until awaited.
pub type Commit = BoxFuture<'static, ProfileResult<()>>;

#[async_trait]
pub trait ChangeTrigger: Send + Sync {
    /// Prepare a change to `target` that the dev server will want to rebuild.
    async fn prepare(&self, target: &Path) -> ProfileResult<Commit>;
}

pub const NONCE_PRELUDE: &str = "\n/*** NONCE:";
pub const NONCE_POSTLUDE: &str = ":NONCE ***/\n";

/// Rewrites a trailing comment block with a fresh random nonce on every call.
///
/// The file stays syntactically valid for any language with `/* */`
/// comments, and its content always differs from the previous revision.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonceMutator;

impl NonceMutator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChangeTrigger for NonceMutator {
    async fn prepare(&self, target: &Path) -> ProfileResult<Commit> {
        let content = tokio::fs::read_to_string(target)
            .await
            .map_err(|e| ProfileError::mutation(target.display().to_string(), e))?;

        let nonce = random_nonce();
        trace!(file = %target.display(), %nonce, "Prepared nonce change");
        let updated = inject_nonce(&content, &nonce);

        let target = target.to_path_buf();
        Ok(Box::pin(async move {
            tokio::fs::write(&target, updated)
                .await
                .map_err(|e| ProfileError::mutation(target.display().to_string(), e))
        }))
    }
}

/// 32 random bytes as 64 lowercase hex characters.
pub fn random_nonce() -> String {
    let bytes: [u8; 32] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Replace the existing nonce block, or append one if there is none.
///
/// A prelude with no postlude after it counts as no block.
pub fn inject_nonce(content: &str, nonce: &str) -> String {
    let block = format!("{NONCE_PRELUDE}{nonce}{NONCE_POSTLUDE}");

    let existing = content.find(NONCE_PRELUDE).and_then(|start| {
        let after = start + NONCE_PRELUDE.len();
        content[after..]
            .find(NONCE_POSTLUDE)
            .map(|offset| (start, after + offset + NONCE_POSTLUDE.len()))
    });

    match existing {
        Some((start, end)) => format!("{}{block}{}", &content[..start], &content[end..]),
        None => format!("{content}{block}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_block_when_absent() {
        let out = inject_nonce("export default 1;\n", "abc");
        assert_eq!(out, "export default 1;\n\n/*** NONCE:abc:NONCE ***/\n");
    }

    #[test]
    fn replaces_existing_block_in_place() {
        let once = inject_nonce("const a = 1;\n", "first");
        let twice = inject_nonce(&once, "second");

        assert_eq!(twice, "const a = 1;\n\n/*** NONCE:second:NONCE ***/\n");
        assert_eq!(twice.matches("NONCE:").count(), 1);
    }

    #[test]
    fn keeps_content_after_the_block() {
        let content = "a\n/*** NONCE:old:NONCE ***/\nb";
        assert_eq!(
            inject_nonce(content, "new"),
            "a\n/*** NONCE:new:NONCE ***/\nb"
        );
    }

    #[test]
    fn dangling_prelude_is_treated_as_absent() {
        let content = "x\n/*** NONCE:broken";
        let out = inject_nonce(content, "n");
        assert_eq!(out, format!("{content}\n/*** NONCE:n:NONCE ***/\n"));
    }

    #[test]
    fn nonce_is_64_hex_chars() {
        let nonce = random_nonce();
        assert_eq!(nonce.len(), 64);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(nonce, random_nonce());
    }

    #[tokio::test]
    async fn commit_is_deferred_until_awaited() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.tsx");
        std::fs::write(&path, "export default () => null;\n").unwrap();

        let commit = NonceMutator::new().prepare(&path).await.unwrap();
        assert!(!std::fs::read_to_string(&path).unwrap().contains("NONCE"));

        commit.await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("export default () => null;\n"));
        assert!(content.ends_with(NONCE_POSTLUDE));
    }

    #[tokio::test]
    async fn missing_target_is_a_mutation_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = NonceMutator::new()
            .prepare(&dir.path().join("missing.tsx"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProfileError::Mutation { .. }));
    }
}
