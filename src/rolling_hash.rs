/// rsync-style weak checksum over a sliding window.
///
/// `β1` is the plain byte sum and `β2` the position-weighted sum, both mod
/// 2^16; the digest packs them as `β1 + 2^16·β2`. Because the modulus divides
/// 2^32, wrapping u32 arithmetic followed by a mask gives exact results.
const M: u32 = 1 << 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct RollingHash {
    b1: u32,
    b2: u32,
    window_size: u32,
}

impl RollingHash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the hash over a full window of data.
    pub fn init(&mut self, data: &[u8]) {
        let len = data.len() as u32;
        let mut b1: u32 = 0;
        let mut b2: u32 = 0;
        for (i, &byte) in data.iter().enumerate() {
            b1 = b1.wrapping_add(byte as u32);
            b2 = b2.wrapping_add((len - i as u32).wrapping_mul(byte as u32));
        }
        self.b1 = b1 % M;
        self.b2 = b2 % M;
        self.window_size = len;
    }

    /// Slide the window by one: drop `old_byte` from the front, append
    /// `new_byte` at the back.
    pub fn rotate(&mut self, old_byte: u8, new_byte: u8) {
        let old = old_byte as u32;
        let new = new_byte as u32;
        self.b1 = self.b1.wrapping_sub(old).wrapping_add(new) % M;
        self.b2 = self
            .b2
            .wrapping_sub(self.window_size.wrapping_mul(old))
            .wrapping_add(self.b1)
            % M;
    }

    pub fn digest(&self) -> u32 {
        self.b1 + M * self.b2
    }
}

/// Weak hash of a single block.
pub fn weak_hash(data: &[u8]) -> u32 {
    let mut h = RollingHash::new();
    h.init(data);
    h.digest()
}
