//! Root authentication tag over all chunk tags
//!
//! ```text
//! root = HMAC-SHA256(share_key, tag_0 || tag_1 || ... || tag_n)
//! ```
//!
//! The root is stored in the file header. Because every chunk tag already
//! covers its index and last-chunk flag, the root detects reordering,
//! removal and truncation across the whole file.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tcfs_core::{TcfsError, TcfsResult};
use tcfs_crypto::ShareKey;

use crate::header::ROOT_TAG_SIZE;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug)]
pub struct AuthTagVerifier {
    tags: Vec<Option<Vec<u8>>>,
    tag_length: usize,
    share_key: ShareKey,
    needs_update: bool,
}

impl AuthTagVerifier {
    pub fn new(share_key: &ShareKey, tag_length: usize) -> Self {
        Self {
            tags: Vec::new(),
            tag_length,
            share_key: share_key.clone(),
            needs_update: false,
        }
    }

    /// Record a tag read back from storage; the root stays clean.
    pub fn insert_tag(&mut self, index: u64, tag: &[u8]) -> TcfsResult<()> {
        if tag.len() != self.tag_length {
            return Err(TcfsError::Encryption(format!(
                "chunk {index} tag is {} bytes (expected {})",
                tag.len(),
                self.tag_length
            )));
        }
        let slot = slot(index)?;
        if self.tags.len() <= slot {
            self.tags.resize(slot + 1, None);
        }
        self.tags[slot] = Some(tag.to_vec());
        Ok(())
    }

    /// Record the tag of a chunk that was just written to storage.
    pub fn update_tag(&mut self, index: u64, tag: &[u8]) -> TcfsResult<()> {
        self.insert_tag(index, tag)?;
        self.needs_update = true;
        Ok(())
    }

    /// Forget the tag of a truncated chunk. The root is not rebuilt.
    pub fn remove_tag(&mut self, index: u64) -> TcfsResult<()> {
        let slot = slot(index)?;
        if slot + 1 == self.tags.len() {
            self.tags.pop();
            while matches!(self.tags.last(), Some(None)) {
                self.tags.pop();
            }
        } else if let Some(entry) = self.tags.get_mut(slot) {
            *entry = None;
        }
        Ok(())
    }

    pub fn tag(&self, index: u64) -> Option<&[u8]> {
        let slot = usize::try_from(index).ok()?;
        self.tags.get(slot).and_then(|t| t.as_deref())
    }

    /// Number of chunk slots tracked, including gaps.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn needs_update(&self) -> bool {
        self.needs_update
    }

    /// Called once the rebuilt root has been written to the header.
    pub fn mark_persisted(&mut self) {
        self.needs_update = false;
    }

    pub fn build_root_tag(&self) -> TcfsResult<[u8; ROOT_TAG_SIZE]> {
        Ok(self.root_mac()?.finalize().into_bytes().into())
    }

    /// Compare the root over the current tags with the root stored in the
    /// header. A file without chunks verifies only against an absent root.
    pub fn verify_root_tag(&self, stored: Option<&[u8; ROOT_TAG_SIZE]>) -> TcfsResult<bool> {
        match (self.tags.is_empty(), stored) {
            (true, None) => Ok(true),
            (true, Some(_)) | (false, None) => Ok(false),
            (false, Some(stored)) => Ok(self.root_mac()?.verify_slice(stored).is_ok()),
        }
    }

    fn root_mac(&self) -> TcfsResult<HmacSha256> {
        if self.tags.is_empty() {
            return Err(TcfsError::Encryption(
                "no chunk authentication tags have been set yet".into(),
            ));
        }
        let mut mac = self.new_mac()?;
        for (index, tag) in self.tags.iter().enumerate() {
            match tag {
                Some(tag) if tag.len() == self.tag_length => mac.update(tag),
                Some(_) => {
                    return Err(TcfsError::Encryption(format!(
                        "chunk {index} authentication tag has the wrong length"
                    )))
                }
                None => {
                    return Err(TcfsError::Encryption(format!(
                        "chunk {index} authentication tag is missing"
                    )))
                }
            }
        }
        Ok(mac)
    }

    fn new_mac(&self) -> TcfsResult<HmacSha256> {
        <HmacSha256 as Mac>::new_from_slice(self.share_key.as_bytes())
            .map_err(|e| TcfsError::Encryption(format!("HMAC key setup failed: {e}")))
    }
}

fn slot(index: u64) -> TcfsResult<usize> {
    usize::try_from(index)
        .map_err(|_| TcfsError::Encryption(format!("chunk index {index} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcfs_crypto::generate_share_key;

    const TAG: usize = 12;

    fn verifier_with(count: u8) -> AuthTagVerifier {
        let mut v = AuthTagVerifier::new(&generate_share_key(), TAG);
        for i in 0..count {
            v.update_tag(u64::from(i), &[i; TAG]).unwrap();
        }
        v
    }

    #[test]
    fn test_insert_does_not_mark_dirty() {
        let mut v = AuthTagVerifier::new(&generate_share_key(), TAG);
        v.insert_tag(0, &[1; TAG]).unwrap();
        assert!(!v.needs_update());

        v.update_tag(1, &[2; TAG]).unwrap();
        assert!(v.needs_update());
        v.mark_persisted();
        assert!(!v.needs_update());
    }

    #[test]
    fn test_root_roundtrip() {
        let v = verifier_with(3);
        let root = v.build_root_tag().unwrap();
        assert!(v.verify_root_tag(Some(&root)).unwrap());

        let mut wrong = root;
        wrong[0] ^= 1;
        assert!(!v.verify_root_tag(Some(&wrong)).unwrap());
        assert!(!v.verify_root_tag(None).unwrap(), "chunks without a stored root must not verify");
    }

    #[test]
    fn test_root_depends_on_order() {
        let share = generate_share_key();
        let mut a = AuthTagVerifier::new(&share, TAG);
        a.insert_tag(0, &[1; TAG]).unwrap();
        a.insert_tag(1, &[2; TAG]).unwrap();
        let mut b = AuthTagVerifier::new(&share, TAG);
        b.insert_tag(0, &[2; TAG]).unwrap();
        b.insert_tag(1, &[1; TAG]).unwrap();
        assert_ne!(a.build_root_tag().unwrap(), b.build_root_tag().unwrap());
    }

    #[test]
    fn test_root_depends_on_share_key() {
        let mut a = AuthTagVerifier::new(&generate_share_key(), TAG);
        let mut b = AuthTagVerifier::new(&generate_share_key(), TAG);
        a.insert_tag(0, &[7; TAG]).unwrap();
        b.insert_tag(0, &[7; TAG]).unwrap();
        assert_ne!(a.build_root_tag().unwrap(), b.build_root_tag().unwrap());
    }

    #[test]
    fn test_empty_has_no_root() {
        let v = AuthTagVerifier::new(&generate_share_key(), TAG);
        assert!(matches!(v.build_root_tag(), Err(TcfsError::Encryption(_))));
        assert!(v.verify_root_tag(None).unwrap());
        assert!(!v.verify_root_tag(Some(&[0xAA; ROOT_TAG_SIZE])).unwrap());
    }

    #[test]
    fn test_missing_tag_fails_build() {
        let mut v = AuthTagVerifier::new(&generate_share_key(), TAG);
        v.insert_tag(2, &[1; TAG]).unwrap();
        assert_eq!(v.len(), 3);
        assert!(matches!(v.build_root_tag(), Err(TcfsError::Encryption(_))));
        assert!(v.verify_root_tag(Some(&[0; ROOT_TAG_SIZE])).is_err());
    }

    #[test]
    fn test_wrong_length_rejected() {
        let mut v = AuthTagVerifier::new(&generate_share_key(), TAG);
        assert!(matches!(v.insert_tag(0, &[1; 16]), Err(TcfsError::Encryption(_))));
    }

    #[test]
    fn test_remove_tail_tags() {
        let mut v = verifier_with(4);
        let full_root = v.build_root_tag().unwrap();

        v.remove_tag(3).unwrap();
        v.remove_tag(2).unwrap();
        assert_eq!(v.len(), 2);
        assert!(v.tag(2).is_none());
        assert_ne!(v.build_root_tag().unwrap(), full_root, "removed tags leave the root derivation");

        v.remove_tag(1).unwrap();
        v.remove_tag(0).unwrap();
        assert!(v.is_empty());
    }

    #[test]
    fn test_remove_middle_leaves_gap() {
        let mut v = verifier_with(3);
        v.remove_tag(1).unwrap();
        assert_eq!(v.len(), 3);
        assert!(v.tag(1).is_none());
        assert!(v.build_root_tag().is_err());

        v.remove_tag(2).unwrap();
        assert_eq!(v.len(), 1, "trailing gaps are trimmed with the tail");
    }
}
