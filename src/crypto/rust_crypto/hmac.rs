//! HMAC utilities using RustCrypto.

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::buffer::Buf;

/// TLS 1.2 P_hash over the HMAC `M`.
///
/// Writes exactly `output_len` bytes to `out`.
pub(crate) fn p_hash<M>(
    secret: &[u8],
    full_seed: &[u8],
    out: &mut Buf,
    output_len: usize,
) -> Result<(), String>
where
    M: Mac + KeyInit,
{
    out.clear();

    let new_mac =
        || <M as KeyInit>::new_from_slice(secret).map_err(|_| "Invalid HMAC key length".to_string());

    // A(1) = HMAC_hash(secret, A(0)) where A(0) = seed
    let mut a_hmac = new_mac()?;
    Mac::update(&mut a_hmac, full_seed);
    let mut a = a_hmac.finalize().into_bytes();

    while out.len() < output_len {
        // HMAC_hash(secret, A(i) + seed)
        let mut ctx = new_mac()?;
        Mac::update(&mut ctx, &a);
        Mac::update(&mut ctx, full_seed);
        let output = ctx.finalize().into_bytes();

        let remaining = output_len - out.len();
        let to_copy = remaining.min(output.len());
        out.extend_from_slice(&output[..to_copy]);

        if out.len() < output_len {
            // A(i+1) = HMAC_hash(secret, A(i))
            let mut next_a = new_mac()?;
            Mac::update(&mut next_a, &a);
            a = next_a.finalize().into_bytes();
        }
    }

    Ok(())
}

/// TLS 1.2 PRF: P_hash(secret, label + seed).
pub(crate) fn prf<M>(
    secret: &[u8],
    label: &str,
    seed: &[u8],
    out: &mut Buf,
    output_len: usize,
) -> Result<(), String>
where
    M: Mac + KeyInit,
{
    let mut full_seed = Vec::with_capacity(label.len() + seed.len());
    full_seed.extend_from_slice(label.as_bytes());
    full_seed.extend_from_slice(seed);
    p_hash::<M>(secret, &full_seed, out, output_len)
}

/// HMAC-SHA256 over the concatenation of `parts`.
pub(crate) fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32], String> {
    let mut mac = <Hmac<Sha256> as KeyInit>::new_from_slice(key)
        .map_err(|_| "Invalid HMAC key".to_string())?;
    for p in parts {
        Mac::update(&mut mac, p);
    }
    let bytes = mac.finalize().into_bytes();

    let mut output = [0u8; 32];
    output.copy_from_slice(&bytes);
    Ok(output)
}

/// Constant time comparison of an HMAC-SHA256 tag.
pub(crate) fn verify_hmac_sha256(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> bool {
    let Ok(mut mac) = <Hmac<Sha256> as KeyInit>::new_from_slice(key) else {
        return false;
    };
    for p in parts {
        Mac::update(&mut mac, p);
    }
    mac.verify_slice(tag).is_ok()
}
