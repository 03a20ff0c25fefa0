//! WebSocket frame masking

/// XOR a buffer with the 4-byte mask key, word-at-a-time
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    apply_mask_offset(buf, mask, 0)
}

/// XOR a buffer with the mask key, starting at `offset` bytes into the
/// masked stream; used when a payload arrives in several chunks
pub fn apply_mask_offset(buf: &mut [u8], mask: [u8; 4], offset: usize) {
    let mut rotated = mask;
    rotated.rotate_left(offset & 3);

    let word = u32::from_ne_bytes(rotated);
    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let v = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ word;
        chunk.copy_from_slice(&v.to_ne_bytes());
    }
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= rotated[i & 3];
    }
}

/// Generate a mask key from thread-local xorshift64 state
pub fn generate_mask() -> [u8; 4] {
    (xorshift() as u32).to_ne_bytes()
}

/// Generate a random 16-byte `Sec-WebSocket-Key`, base64-encoded
pub fn generate_key() -> String {
    use base64::Engine;

    let mut bytes = [0u8; 16];
    for chunk in bytes.chunks_mut(8) {
        let v = xorshift().to_ne_bytes();
        chunk.copy_from_slice(&v[..chunk.len()]);
    }
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn xorshift() -> u64 {
    use std::cell::Cell;
    use std::time::{SystemTime, UNIX_EPOCH};

    thread_local! {
        static STATE: Cell<u64> = const { Cell::new(0) };
    }

    STATE.with(|state| {
        let mut s = state.get();
        if s == 0 {
            s = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64;
            // Mix in a stack address so concurrent threads diverge
            s ^= &s as *const _ as u64;
        }
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        state.set(s);
        s
    })
}
