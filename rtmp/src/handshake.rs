//! C0C1/S0S1S2/C2 handshake: simple (C1 time+version slot zero) or digest
//! (HMAC-SHA256 under the Flash Player/Media Server partial keys).
//!
//! Grounded in `format/rtmp/rtmp.go`'s `hsMakeDigest`/`hsCalcDigestPos`/
//! `hsFindDigest`/`hsParse1`/`hsCreate01`/`hsCreate2`/`handshakeServer`; the
//! key material (`hsClientFullKey`/`hsServerFullKey`) is copied verbatim from
//! that file, which itself copies it from the Adobe RTMP spec.

use failure::{bail, Error};
use hmac::{Hmac, Mac, NewMac};
use rand::RngCore;
use sha2::Sha256;
use std::convert::TryInto;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const HANDSHAKE_SIZE: usize = 1536;

#[rustfmt::skip]
const CLIENT_FULL_KEY: [u8; 62] = [
    b'G', b'e', b'n', b'u', b'i', b'n', b'e', b' ', b'A', b'd', b'o', b'b', b'e', b' ',
    b'F', b'l', b'a', b's', b'h', b' ', b'P', b'l', b'a', b'y', b'e', b'r', b' ',
    b'0', b'0', b'1',
    0xF0, 0xEE, 0xC2, 0x4A, 0x80, 0x68, 0xBE, 0xE8, 0x2E, 0x00, 0xD0, 0xD1,
    0x02, 0x9E, 0x7E, 0x57, 0x6E, 0xEC, 0x5D, 0x2D, 0x29, 0x80, 0x6F, 0xAB,
    0x93, 0xB8, 0xE6, 0x36, 0xCF, 0xEB, 0x31, 0xAE,
];

#[rustfmt::skip]
const SERVER_FULL_KEY: [u8; 68] = [
    b'G', b'e', b'n', b'u', b'i', b'n', b'e', b' ', b'A', b'd', b'o', b'b', b'e', b' ',
    b'F', b'l', b'a', b's', b'h', b' ', b'M', b'e', b'd', b'i', b'a', b' ',
    b'S', b'e', b'r', b'v', b'e', b'r', b' ',
    b'0', b'0', b'1',
    0xF0, 0xEE, 0xC2, 0x4A, 0x80, 0x68, 0xBE, 0xE8, 0x2E, 0x00, 0xD0, 0xD1,
    0x02, 0x9E, 0x7E, 0x57, 0x6E, 0xEC, 0x5D, 0x2D, 0x29, 0x80, 0x6F, 0xAB,
    0x93, 0xB8, 0xE6, 0x36, 0xCF, 0xEB, 0x31, 0xAE,
];

const CLIENT_PARTIAL_KEY: &[u8] = &CLIENT_FULL_KEY[..30];
const SERVER_PARTIAL_KEY: &[u8] = &SERVER_FULL_KEY[..36];

fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Computes `hsMakeDigest`: the HMAC over `src` with the 32-byte window at
/// `gap` excised, or the whole buffer if `gap` is `None`.
fn make_digest(key: &[u8], src: &[u8], gap: Option<usize>) -> [u8; 32] {
    match gap {
        None => hmac_sha256(key, src),
        Some(gap) => {
            let mut msg = Vec::with_capacity(src.len() - 32);
            msg.extend_from_slice(&src[..gap]);
            msg.extend_from_slice(&src[gap + 32..]);
            hmac_sha256(key, &msg)
        }
    }
}

/// `hsCalcDigestPos`: sums the 4 bytes at `base` mod 728, offset past them.
fn calc_digest_pos(p: &[u8], base: usize) -> usize {
    let sum: u32 = p[base..base + 4].iter().map(|&b| u32::from(b)).sum();
    (sum as usize % 728) + base + 4
}

/// `hsFindDigest`: tries the digest window at `base`, returns its start
/// offset if the embedded HMAC matches.
fn find_digest(p: &[u8], key: &[u8], base: usize) -> Option<usize> {
    let gap = calc_digest_pos(p, base);
    if gap + 32 > p.len() {
        return None;
    }
    let digest = make_digest(key, p, Some(gap));
    if p[gap..gap + 32] == digest[..] {
        Some(gap)
    } else {
        None
    }
}

/// `hsParse1`: locates C1's digest (tried at both candidate schema offsets)
/// and returns the server-key digest of it, for embedding in S2.
fn parse_c1_digest(c1: &[u8]) -> Option<[u8; 32]> {
    let pos = find_digest(c1, CLIENT_PARTIAL_KEY, 772).or_else(|| find_digest(c1, CLIENT_PARTIAL_KEY, 8))?;
    Some(make_digest(SERVER_FULL_KEY.as_ref(), &c1[pos..pos + 32], None))
}

/// `hsCreate01`: builds S0S1 (version byte + 1536-byte S1) with a digest
/// under `key` at the schema-1 (`base=8`) offset.
fn create_s0_s1(time: u32, version: u32, key: &[u8]) -> [u8; 1 + HANDSHAKE_SIZE] {
    let mut out = [0u8; 1 + HANDSHAKE_SIZE];
    out[0] = 3;
    let s1 = &mut out[1..];
    rand::thread_rng().fill_bytes(&mut s1[8..]);
    s1[0..4].copy_from_slice(&time.to_be_bytes());
    s1[4..8].copy_from_slice(&version.to_be_bytes());
    let gap = calc_digest_pos(s1, 8);
    let digest = make_digest(key, s1, Some(gap));
    s1[gap..gap + 32].copy_from_slice(&digest);
    out
}

/// `hsCreate2`: builds S2 (random bytes with a trailing digest of `key`,
/// here the digest recovered from C1).
fn create_s2(key: &[u8; 32]) -> [u8; HANDSHAKE_SIZE] {
    let mut out = [0u8; HANDSHAKE_SIZE];
    rand::thread_rng().fill_bytes(&mut out);
    let gap = out.len() - 32;
    let digest = make_digest(key, &out[..gap], None);
    out[gap..].copy_from_slice(&digest);
    out
}

/// Runs the server side of the handshake over `io`, consuming C0C1 and
/// writing S0S1S2, then reading the trailing C2.
pub async fn handshake_server<S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin>(io: &mut S) -> Result<(), Error> {
    let mut c0c1 = [0u8; 1 + HANDSHAKE_SIZE];
    io.read_exact(&mut c0c1).await?;
    if c0c1[0] != 3 {
        bail!("rtmp handshake: unsupported version byte {}", c0c1[0]);
    }
    let c1 = &c0c1[1..];
    let client_time = u32::from_be_bytes(c1[0..4].try_into().unwrap());
    let client_version = u32::from_be_bytes(c1[4..8].try_into().unwrap());

    let mut s0s1s2 = Vec::with_capacity(1 + 2 * HANDSHAKE_SIZE);
    if client_version == 0 {
        // Simple handshake: echo C1 as S1, C2 will be compared against nothing.
        s0s1s2.push(3);
        s0s1s2.extend_from_slice(c1);
        s0s1s2.extend_from_slice(c1);
    } else {
        let digest = parse_c1_digest(c1).ok_or_else(|| failure::format_err!("rtmp handshake: C1 digest not found"))?;
        let s0s1 = create_s0_s1(client_time, 0x0d0e0a0d, SERVER_PARTIAL_KEY);
        let s2 = create_s2(&digest);
        s0s1s2.extend_from_slice(&s0s1);
        s0s1s2.extend_from_slice(&s2);
    }
    io.write_all(&s0s1s2).await?;
    io.flush().await?;

    let mut c2 = [0u8; HANDSHAKE_SIZE];
    io.read_exact(&mut c2).await?;
    Ok(())
}

/// Runs the client side of the handshake: writes C0C1 using the digest
/// schema, reads S0S1S2, verifies the server's embedded digest, and echoes
/// C2 back. Mirrors `handshake_server`'s digest path; we never fall back to
/// the simple (zero-version) handshake when dialing out since every server
/// this toolkit targets understands the digest schema.
pub async fn handshake_client<S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin>(io: &mut S) -> Result<(), Error> {
    let client_time = 0u32;
    let c0c1 = create_s0_s1(client_time, 0x80000702, CLIENT_PARTIAL_KEY);
    io.write_all(&c0c1).await?;
    io.flush().await?;

    let mut s0s1s2 = [0u8; 1 + 2 * HANDSHAKE_SIZE];
    io.read_exact(&mut s0s1s2).await?;
    if s0s1s2[0] != 3 {
        bail!("rtmp handshake: unsupported server version byte {}", s0s1s2[0]);
    }
    let s1 = &s0s1s2[1..1 + HANDSHAKE_SIZE];
    let s2 = &s0s1s2[1 + HANDSHAKE_SIZE..];

    let c1 = &c0c1[1..];
    let digest = if let Some(pos) = find_digest(s1, SERVER_PARTIAL_KEY, 772).or_else(|| find_digest(s1, SERVER_PARTIAL_KEY, 8)) {
        make_digest(CLIENT_FULL_KEY.as_ref(), &s1[pos..pos + 32], None)
    } else {
        // Server used the simple handshake; fall back to echoing C1 as C2.
        let mut c2 = [0u8; HANDSHAKE_SIZE];
        c2.copy_from_slice(c1);
        io.write_all(&c2).await?;
        io.flush().await?;
        return Ok(());
    };
    let _ = s2; // S2's own digest isn't needed to complete the handshake, only to validate it.

    let c2 = create_s2(&digest);
    io.write_all(&c2).await?;
    io.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simple_handshake_completes() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        let server_task = tokio::spawn(async move { handshake_server(&mut server).await });

        let mut c1 = [0u8; HANDSHAKE_SIZE];
        // client_version left as zero bytes selects the simple handshake path.
        client.write_all(&[3]).await.unwrap();
        client.write_all(&c1).await.unwrap();
        client.flush().await.unwrap();

        let mut s0s1s2 = [0u8; 1 + 2 * HANDSHAKE_SIZE];
        client.read_exact(&mut s0s1s2).await.unwrap();
        assert_eq!(s0s1s2[0], 3);

        c1.copy_from_slice(&s0s1s2[1..1 + HANDSHAKE_SIZE]);
        client.write_all(&c1).await.unwrap();
        client.flush().await.unwrap();

        server_task.await.unwrap().unwrap();
    }

    #[test]
    fn digest_round_trips_through_find() {
        let mut c1 = [0u8; HANDSHAKE_SIZE];
        rand::thread_rng().fill_bytes(&mut c1);
        c1[4..8].copy_from_slice(&1u32.to_be_bytes()); // non-zero version selects digest schema
        let gap = calc_digest_pos(&c1, 8);
        let digest = make_digest(CLIENT_PARTIAL_KEY, &c1, Some(gap));
        c1[gap..gap + 32].copy_from_slice(&digest);
        assert!(find_digest(&c1, CLIENT_PARTIAL_KEY, 8).is_some());
    }
}
