//! Fast 64-bit string hash (rapidhash)
//!
//! Non-cryptographic and NOT attacker-resistant: maps keyed by untrusted
//! input (header names) are a known DoS surface. The map layer bounds the
//! damage through arena ceilings rather than hash hardening.

const SECRET: [u64; 8] = [
    0x2d358dccaa6c78a5,
    0x8bb84b93962eacc9,
    0x4b33a62ed433d4a3,
    0x4d5a2da51de1aa47,
    0xa0761d6478bd642f,
    0xe7037ed1a0b428db,
    0x90ed1765281c388c,
    0xaaaaaaaaaaaaaaaa,
];

#[inline]
fn mum(a: u64, b: u64) -> (u64, u64) {
    let r = (a as u128) * (b as u128);
    (r as u64, (r >> 64) as u64)
}

#[inline]
fn mix(a: u64, b: u64) -> u64 {
    let (lo, hi) = mum(a, b);
    lo ^ hi
}

#[inline]
fn read64(p: &[u8]) -> u64 {
    u64::from_le_bytes(p[..8].try_into().unwrap())
}

#[inline]
fn read32(p: &[u8]) -> u64 {
    u32::from_le_bytes(p[..4].try_into().unwrap()) as u64
}

/// Hash `key` with the given seed.
pub fn rapidhash(key: &[u8], mut seed: u64) -> u64 {
    let len = key.len();
    seed ^= mix(seed ^ SECRET[2], SECRET[1]);
    let a;
    let b;
    let mut p = key;
    let mut i = len;

    if len <= 16 {
        if len >= 4 {
            seed ^= len as u64;
            if len >= 8 {
                a = read64(&key[..8]);
                b = read64(&key[len - 8..]);
            } else {
                a = read32(&key[..4]);
                b = read32(&key[len - 4..]);
            }
        } else if len > 0 {
            a = ((key[0] as u64) << 45) | key[len - 1] as u64;
            b = key[len >> 1] as u64;
        } else {
            a = 0;
            b = 0;
        }
    } else {
        if i > 48 {
            let mut see1 = seed;
            let mut see2 = seed;
            loop {
                seed = mix(read64(p) ^ SECRET[0], read64(&p[8..]) ^ seed);
                see1 = mix(read64(&p[16..]) ^ SECRET[1], read64(&p[24..]) ^ see1);
                see2 = mix(read64(&p[32..]) ^ SECRET[2], read64(&p[40..]) ^ see2);
                p = &p[48..];
                i -= 48;
                if i <= 48 {
                    break;
                }
            }
            seed ^= see1;
            seed ^= see2;
        }
        if i > 16 {
            seed = mix(read64(p) ^ SECRET[2], read64(&p[8..]) ^ seed);
            if i > 32 {
                seed = mix(read64(&p[16..]) ^ SECRET[2], read64(&p[24..]) ^ seed);
            }
        }
        // The last two words always come from the tail of the whole key;
        // the remainder `i` can be shorter than 16 after the block loop.
        a = read64(&key[len - 16..]) ^ i as u64;
        b = read64(&key[len - 8..]);
    }

    let (lo, hi) = mum(a ^ SECRET[1], b ^ seed);
    mix(lo ^ SECRET[7], hi ^ SECRET[1] ^ i as u64)
}

/// Hash a key with the default seed.
#[inline]
pub fn hash_bytes(key: &[u8]) -> u64 {
    rapidhash(key, 0)
}
