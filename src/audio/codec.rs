//! # G.711 µ-law Transcoder
//!
//! Stateless conversion between the telephony leg's 8-bit µ-law samples and the
//! 16-bit little-endian linear PCM the voice-AI leg expects.
//!
//! ## Byte-Length Relationships:
//! - **µ-law → PCM**: one input byte becomes one 16-bit sample (output is 2× input)
//! - **PCM → µ-law**: every pair of input bytes becomes one µ-law byte (output is ½ input)
//!
//! ## Numeric Semantics:
//! Compression follows ITU-T G.711 (14-bit magnitude, bias of 33, segment search).
//! Expansion uses the segment midpoint for every code, so `compress(expand(c)) == c`
//! for all 256 codes. The negative-zero code `0x7F` expands to `-1`, which lies inside
//! its own quantization cell and keeps the sign, instead of collapsing onto `0xFF`.
//!
//! ## Thread Safety:
//! The decode table is a `const` computed at compile time. There is no other state,
//! so any number of sessions can call these functions concurrently.

use crate::error::BridgeError;
use byteorder::{ByteOrder, LittleEndian};

/// µ-law bias applied to the 14-bit magnitude before the segment search.
const ULAW_BIAS: i16 = 33;

/// Largest biased magnitude representable by µ-law (clip level).
const ULAW_CLIP: i16 = 0x1FFF;

/// Expansion table indexed by µ-law code.
static ULAW_DECODE_TABLE: [i16; 256] = build_decode_table();

const fn build_decode_table() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut code = 0usize;
    while code < 256 {
        table[code] = expand_code(code as u8);
        code += 1;
    }
    table
}

const fn expand_code(code: u8) -> i16 {
    let inverted = !code;
    let exponent = ((inverted >> 4) & 0x07) as i16;
    let mantissa = (inverted & 0x0F) as i16;
    let step = 4i16 << (exponent + 1);
    let magnitude = (0x0080 << exponent) + step * mantissa + step / 2 - 4 * ULAW_BIAS;

    if code < 0x80 {
        // negative zero keeps its sign
        if magnitude == 0 {
            -1
        } else {
            -magnitude
        }
    } else {
        magnitude
    }
}

/// Expand a single µ-law byte into a linear 16-bit sample.
pub fn expand_sample(code: u8) -> i16 {
    ULAW_DECODE_TABLE[code as usize]
}

/// Compress a single linear 16-bit sample into a µ-law byte.
pub fn compress_sample(sample: i16) -> u8 {
    let biased = if sample < 0 {
        (((!sample) as u16) >> 2) as i16 + ULAW_BIAS
    } else {
        (sample >> 2) + ULAW_BIAS
    };
    let biased = biased.min(ULAW_CLIP);

    let mut segment = 1;
    let mut remaining = biased >> 6;
    while remaining != 0 {
        segment += 1;
        remaining >>= 1;
    }

    let high_nibble = 0x0008 - segment;
    let low_nibble = 0x000F - ((biased >> segment) & 0x000F);
    let mut code = (high_nibble << 4) | low_nibble;

    if sample >= 0 {
        code |= 0x0080;
    }

    code as u8
}

/// Decode µ-law bytes into linear PCM16 (little-endian).
///
/// ## Returns:
/// - **Ok(bytes)**: exactly `2 * compressed.len()` bytes
/// - **Err(BridgeError::Decode)**: the input was empty
///
/// Most callers want [`to_linear_pcm`], which maps the empty case to an empty result.
pub fn try_to_linear_pcm(compressed: &[u8]) -> Result<Vec<u8>, BridgeError> {
    if compressed.is_empty() {
        return Err(BridgeError::Decode("empty µ-law payload".to_string()));
    }

    let mut pcm = vec![0u8; compressed.len() * 2];
    for (code, out) in compressed.iter().zip(pcm.chunks_exact_mut(2)) {
        LittleEndian::write_i16(out, expand_sample(*code));
    }
    Ok(pcm)
}

/// Decode µ-law bytes into linear PCM16, treating empty input as a non-fatal skip.
pub fn to_linear_pcm(compressed: &[u8]) -> Vec<u8> {
    try_to_linear_pcm(compressed).unwrap_or_default()
}

/// Encode linear PCM16 (little-endian) into µ-law bytes.
///
/// ## Returns:
/// - **Ok(bytes)**: exactly `pcm.len() / 2` bytes
/// - **Err(BridgeError::Encode)**: the input has an odd number of bytes
pub fn to_compressed(pcm: &[u8]) -> Result<Vec<u8>, BridgeError> {
    if pcm.len() % 2 != 0 {
        return Err(BridgeError::Encode(format!(
            "PCM16 payload length must be even, got {} bytes",
            pcm.len()
        )));
    }

    Ok(pcm
        .chunks_exact(2)
        .map(|pair| compress_sample(LittleEndian::read_i16(pair)))
        .collect())
}
