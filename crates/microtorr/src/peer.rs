use std::fmt::Display;

use rand::{distributions::Alphanumeric, Rng};
use speedy::{Readable, Writable};

use crate::error::Error;

/// Length of a peer id, in bytes.
pub const ID_LENGTH: usize = 20;

/// Identifier chosen at random by every client when it starts. It is made of
/// ASCII alphanumeric characters so it can travel as-is in tracker URLs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Readable, Writable)]
pub struct PeerId([u8; ID_LENGTH]);

impl PeerId {
    pub fn generate() -> Self {
        let mut id = [0u8; ID_LENGTH];
        let mut rng = rand::thread_rng();
        for b in id.iter_mut() {
            *b = rng.sample(Alphanumeric);
        }
        Self(id)
    }

    /// The first 5 characters, enough to tell peers apart in logs.
    pub fn short(&self) -> String {
        self.to_string().chars().take(5).collect()
    }

    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.short())
    }
}

impl From<[u8; ID_LENGTH]> for PeerId {
    fn from(value: [u8; ID_LENGTH]) -> Self {
        Self(value)
    }
}

impl From<PeerId> for [u8; ID_LENGTH] {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl TryFrom<&str> for PeerId {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let bytes = value.as_bytes();
        if bytes.len() != ID_LENGTH || !bytes.iter().all(u8::is_ascii_alphanumeric)
        {
            return Err(Error::PeerIdInvalid);
        }
        let mut buff = [0u8; ID_LENGTH];
        buff.copy_from_slice(bytes);
        Ok(PeerId(buff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert!(a.as_bytes().iter().all(u8::is_ascii_alphanumeric));
        assert_eq!(a.short().len(), 5);
    }

    #[test]
    fn from_str() {
        let id = PeerId::try_from("abcdefghij0123456789").unwrap();
        assert_eq!(id.to_string(), "abcdefghij0123456789");
        assert_eq!(id.short(), "abcde");
        assert_eq!(format!("{id:?}"), "abcde");

        assert!(PeerId::try_from("short").is_err());
        assert!(PeerId::try_from("abcdefghij012345678!").is_err());
    }
}
