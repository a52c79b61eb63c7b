use sha1::{Digest, Sha1};

pub const SHA1_LEN: usize = 20;

pub fn sha1(input: &[u8]) -> [u8; SHA1_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(input);
    hasher.finalize().into()
}

/// SHA-1 over the concatenation of `parts`, without building the
/// concatenated buffer first.
pub fn sha1_parts(parts: &[&[u8]]) -> [u8; SHA1_LEN] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_known_vector() {
        assert_eq!(
            [
                0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78,
                0x50, 0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d
            ],
            sha1(b"abc")
        );
    }

    #[test]
    fn sha1_parts_matches_concatenation() {
        assert_eq!(sha1(b"hello world"), sha1_parts(&[b"hello", b" ", b"world"]));
        assert_eq!(sha1(b""), sha1_parts(&[]));
    }
}
