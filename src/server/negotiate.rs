//! Content-encoding negotiation for pre-compressed static variants.
//!
//! Picks the best [`EncodingVariant`] for a client's `Accept-Encoding`
//! headers. Variants are ordered by ascending size, so under client
//! indifference (q values within 0.1) the smallest acceptable
//! representation wins.

use crate::build::EncodingVariant;

/// Outcome of a negotiation: the chosen variant index plus an optional
/// recoverable warning (logged by the caller, never fatal).
pub struct Negotiated<'v> {
    pub variant: &'v EncodingVariant,
    pub warning: Option<&'static str>,
}

/// Select the variant to serve for the given `Accept-Encoding` values.
///
/// `accept_encoding` carries one entry per header occurrence; each entry may
/// hold a comma-separated list of encoding tokens with optional q values.
pub fn negotiate_encoding<'v>(
    accept_encoding: &[&str],
    encodings: &'v [EncodingVariant],
) -> Option<Negotiated<'v>> {
    if encodings.is_empty() {
        return None;
    }
    if encodings.len() == 1 {
        let warning = if encodings[0].encoding != "identity" {
            Some("identity encoding missing")
        } else {
            None
        };
        return Some(Negotiated {
            variant: &encodings[0],
            warning,
        });
    }

    // default to the identity variant at q = 0
    let mut warning = None;
    let mut max_q = 0.0f64;
    let mut max_idx = match encodings.iter().position(|e| e.encoding == "identity") {
        Some(i) => i,
        None => {
            warning = Some("identity encoding missing");
            encodings.len() - 1
        }
    };

    for header in accept_encoding {
        for token in header.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let mut parts = token.split(';');
            let name = parts.next().unwrap_or("").trim();

            let requested_idx = match encodings.iter().position(|e| e.encoding == name) {
                Some(i) => i,
                None => continue, // not an encoding we can provide
            };

            // q defaults to 1.0; parse failures also read as 1.0
            let mut q = 1.0f64;
            for part in parts {
                let part = part.trim();
                if let Some(qv) = part.strip_prefix("q=") {
                    if let Ok(parsed) = qv.trim().parse::<f64>() {
                        q = parsed;
                    }
                    break;
                }
            }

            // prefer this encoding when the client strongly prefers it, or
            // when the client is indifferent and the server lists it earlier
            // (the list is size-ascending)
            if q - max_q > 0.1 || ((q - max_q).abs() <= 0.1 && requested_idx < max_idx) {
                max_q = q;
                max_idx = requested_idx;
            }
        }
    }

    Some(Negotiated {
        variant: &encodings[max_idx],
        warning,
    })
}
