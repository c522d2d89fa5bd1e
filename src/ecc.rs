//! ECC: Reed-Solomon P/Q parity over GF(2^8), primitive polynomial
//! `0x11D`, as used by CD-ROM Mode 1 and Mode 2 Form 1 sectors.

use std::sync::OnceLock;

struct Luts {
    forward: [u8; 256],
    backward: [u8; 256],
}

fn build_luts() -> Luts {
    let mut forward = [0u8; 256];
    let mut backward = [0u8; 256];

    for i in 0..256u32 {
        let f = ((i << 1) ^ if i & 0x80 != 0 { 0x11D } else { 0 }) as u8;
        forward[i as usize] = f;
        backward[(i as u8 ^ f) as usize] = i as u8;
    }

    Luts { forward, backward }
}

fn luts() -> &'static Luts {
    static LUTS: OnceLock<Luts> = OnceLock::new();
    LUTS.get_or_init(build_luts)
}

/// Compute one ECC parity block (P or Q, selected by the caller's
/// choice of `major_count`/`minor_count`/`major_mult`/`minor_inc`) over
/// `data`, writing `2 * major_count` bytes into `parity`.
pub fn compute_block(
    parity: &mut [u8],
    data: &[u8],
    major_count: usize,
    minor_count: usize,
    major_mult: usize,
    minor_inc: usize,
) {
    let luts = luts();
    let size = major_count * minor_count;

    for major in 0..major_count {
        let mut index = (major >> 1) * major_mult + (major & 1);

        let mut ecc_a = 0u8;
        let mut ecc_b = 0u8;

        for _ in 0..minor_count {
            let temp = data[index];
            index += minor_inc;
            if index >= size {
                index -= size;
            }

            ecc_a ^= temp;
            ecc_b ^= temp;
            ecc_a = luts.forward[ecc_a as usize];
        }

        let p = luts.backward[(luts.forward[ecc_a as usize] ^ ecc_b) as usize];
        parity[major] = p;
        parity[major + major_count] = p ^ ecc_b;
    }
}

/// Parity byte counts for the P pass: major=86, minor=24, mult=2, inc=86.
pub const P_PARITY_SIZE: usize = 2 * 86;
/// Parity byte counts for the Q pass: major=52, minor=43, mult=86, inc=88.
pub const Q_PARITY_SIZE: usize = 2 * 52;

/// Compute both P and Q parity blocks over `data` (the 2064-byte
/// header+user+EDC+zero span the ECC field covers). Q parity is
/// computed, per ECMA-130, over that same 2064 bytes *plus* the
/// freshly generated P parity (2236 bytes total) rather than over
/// `data` alone, so P must be generated first.
pub fn generate(data: &[u8]) -> ([u8; P_PARITY_SIZE], [u8; Q_PARITY_SIZE]) {
    let mut p = [0u8; P_PARITY_SIZE];
    compute_block(&mut p, data, 86, 24, 2, 86);

    let mut q_input = [0u8; 2064 + P_PARITY_SIZE];
    q_input[0..2064].copy_from_slice(&data[0..2064]);
    q_input[2064..].copy_from_slice(&p);

    let mut q = [0u8; Q_PARITY_SIZE];
    compute_block(&mut q, &q_input, 52, 43, 86, 88);

    (p, q)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_is_deterministic_and_sensitive() {
        let data = vec![0x42u8; 2064];
        let (p1, q1) = generate(&data);
        let (p2, q2) = generate(&data);
        assert_eq!(p1, p2);
        assert_eq!(q1, q2);

        let mut flipped = data.clone();
        flipped[0] ^= 1;
        let (p3, q3) = generate(&flipped);
        assert!(p1 != p3 || q1 != q3);
    }
}
