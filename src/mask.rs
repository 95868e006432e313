//! WebSocket frame masking
//!
//! Client frames carry a 4-byte key; the payload is XORed with the key
//! repeated over its length. The same operation masks and unmasks.

/// Apply a WebSocket mask in place
///
/// Processes 8 bytes at a time using a doubled key, then finishes the tail
/// byte by byte. `data` must start at payload offset 0.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    if data.is_empty() {
        return;
    }

    let mask_u64 = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ mask_u64;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    // Full 8-byte chunks keep the key aligned, so the tail restarts at key[0]
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}
