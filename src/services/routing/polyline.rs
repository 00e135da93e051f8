//! Encoded polyline decoding
//!
//! Mapbox and OSRM both return `polyline6` when asked; precision 5 is the
//! classic Google format.

use super::ProviderError;

/// Decode an encoded polyline into `[lng, lat]` pairs
pub fn decode_polyline(encoded: &str, precision: u32) -> Result<Vec<[f64; 2]>, ProviderError> {
    let factor = 10_f64.powi(precision as i32);
    let bytes = encoded.as_bytes();
    let mut coordinates = Vec::new();
    let mut lat = 0i64;
    let mut lng = 0i64;
    let mut i = 0;

    while i < bytes.len() {
        lat = accumulate(lat, next_delta(bytes, &mut i)?)?;
        lng = accumulate(lng, next_delta(bytes, &mut i)?)?;

        // GeoJSON uses [lng, lat] order
        coordinates.push([lng as f64 / factor, lat as f64 / factor]);
    }

    Ok(coordinates)
}

fn accumulate(total: i64, delta: i64) -> Result<i64, ProviderError> {
    total
        .checked_add(delta)
        .ok_or_else(|| ProviderError::Malformed("polyline coordinate out of range".to_string()))
}

fn next_delta(bytes: &[u8], i: &mut usize) -> Result<i64, ProviderError> {
    let mut shift = 0;
    let mut result = 0i64;
    loop {
        if *i >= bytes.len() || shift > 60 {
            return Err(ProviderError::Malformed("invalid polyline encoding".to_string()));
        }
        let byte = bytes[*i] as i64 - 63;
        if byte < 0 {
            return Err(ProviderError::Malformed("invalid polyline character".to_string()));
        }
        *i += 1;
        result |= (byte & 0x1f) << shift;
        shift += 5;
        if byte < 0x20 {
            break;
        }
    }
    Ok(if result & 1 != 0 { !(result >> 1) } else { result >> 1 })
}
