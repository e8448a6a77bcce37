//! PEM handling for TLS material and for the single-blob cache bundle format.
//!
//! A cache bundle is the certificate PEM followed by the private key PEM, joined by a newline.
//! Bundles written by naive concatenation may repeat `END` lines, which [`split_bundle`]
//! tolerates.

const CERTIFICATE_HEADER: &[u8] = b"-----BEGIN CERTIFICATE-----";
const CERTIFICATE_FOOTER: &[u8] = b"-----END CERTIFICATE-----";
const BEGIN_PREFIX: &[u8] = b"-----BEGIN ";
const END_PREFIX: &[u8] = b"-----END ";
const PRIVATE_KEY_SUFFIX: &[u8] = b"PRIVATE KEY-----";

/// Splits a byte sequence of PEM-encoded certificates.
///
/// It can tolerate additional contents between the actual PEM certificates, such as
/// the private key of a bundle.
pub fn split_pem_certificates(pem: &[u8]) -> Vec<&[u8]> {
    let mut certs = Vec::new();
    let mut pos = 0;

    while pos + CERTIFICATE_HEADER.len() <= pem.len() {
        if &pem[pos..pos + CERTIFICATE_HEADER.len()] != CERTIFICATE_HEADER {
            pos += 1;
            continue;
        }

        let start = pos;
        pos += CERTIFICATE_HEADER.len();

        while pos + CERTIFICATE_FOOTER.len() <= pem.len() {
            if &pem[pos..pos + CERTIFICATE_FOOTER.len()] == CERTIFICATE_FOOTER {
                pos += CERTIFICATE_FOOTER.len();
                certs.push(&pem[start..pos]);
                break;
            }
            pos += 1;
        }
    }

    certs
}

/// Joins a certificate (chain) and its private key into a cache bundle.
pub fn encode_bundle(cert_pem: &[u8], key_pem: &[u8]) -> Vec<u8> {
    let mut bundle = Vec::with_capacity(cert_pem.len() + key_pem.len() + 1);
    bundle.extend_from_slice(cert_pem);
    bundle.push(b'\n');
    bundle.extend_from_slice(key_pem);
    bundle
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn is_private_key_header(line: &[u8]) -> bool {
    let line = trim_line(line);
    line.starts_with(BEGIN_PREFIX) && line.ends_with(PRIVATE_KEY_SUFFIX)
}

/// Offset of the first line at or after `from` that opens a block other than a certificate.
fn first_non_certificate_block(bundle: &[u8], from: usize) -> Option<usize> {
    let mut offset = from;
    for line in bundle[from..].split_inclusive(|b| *b == b'\n') {
        if line.starts_with(BEGIN_PREFIX) && !line.starts_with(CERTIFICATE_HEADER) {
            return Some(offset);
        }
        offset += line.len();
    }
    None
}

/// Cuts `END` lines that close no block off the end of `section`.
///
/// Only applies once no further block follows, anything else is kept as is.
fn trim_stray_end_markers(section: &[u8]) -> &[u8] {
    let mut in_block = false;
    let mut offset = 0;
    for line in section.split_inclusive(|b| *b == b'\n') {
        if line.starts_with(BEGIN_PREFIX) {
            in_block = true;
        } else if line.starts_with(END_PREFIX) {
            if !in_block && find(&section[offset..], BEGIN_PREFIX).is_none() {
                return &section[..offset];
            }
            in_block = false;
        }
        offset += line.len();
    }
    section
}

/// Splits a cache bundle into its certificate PEM and private key PEM.
///
/// Both parts are exact byte ranges of the bundle, so whatever went into [`encode_bundle`]
/// comes back byte-identical, including a missing trailing newline or non-block lines such
/// as `Bag Attributes` and `EC PARAMETERS` ahead of the key. `END` markers that were
/// duplicated by concatenation are cut off the end of either part.
///
/// Returns [`None`] if the bundle lacks either a certificate or a private key.
pub fn split_bundle(bundle: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let cert_start = find(bundle, CERTIFICATE_HEADER)?;
    let key_begin = first_non_certificate_block(bundle, cert_start)?;
    let last_cert_end = cert_start
        + rfind(&bundle[cert_start..key_begin], CERTIFICATE_FOOTER)?
        + CERTIFICATE_FOOTER.len();

    // The joining newline is either followed by a blank line (the certificate kept its own
    // trailing newline) or directly by the key material
    let between = &bundle[last_cert_end..key_begin];
    let (cert_end, key_start) = match find(between, b"\n\n") {
        Some(blank) => (last_cert_end + blank + 1, last_cert_end + blank + 2),
        None if between.starts_with(b"\n") => (last_cert_end, last_cert_end + 1),
        None => (last_cert_end, last_cert_end),
    };

    let cert = trim_stray_end_markers(&bundle[cert_start..cert_end]);
    let key = trim_stray_end_markers(&bundle[key_start..]);
    key.split_inclusive(|b| *b == b'\n')
        .any(is_private_key_header)
        .then(|| (cert.to_vec(), key.to_vec()))
}
