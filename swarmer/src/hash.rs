#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha256(pub(crate) [u8; 32]);

impl Sha256 {
    pub fn hash(buf: &[u8]) -> Sha256 {
        use sha2::Digest;
        let mut hasher = sha2::Sha256::default();
        hasher.update(buf);
        Sha256(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Sha256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Sha256(")?;
        for v in self.0 {
            write!(f, "{:02x}", v)?;
        }
        f.write_str(")")?;
        Ok(())
    }
}

impl std::fmt::Display for Sha256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for v in self.0 {
            write!(f, "{:02x}", v)?;
        }
        Ok(())
    }
}

/// Short integrity check carried by data-channel requests: the leading four bytes of the SHA-1
/// digest of `buf`, read big-endian.
pub fn checksum(buf: &[u8]) -> u32 {
    use sha1::Digest;
    let mut hasher = sha1::Sha1::default();
    hasher.update(buf);
    let digest: [u8; 20] = hasher.finalize().into();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}
