//! Erasure-coded stripes.
//!
//! A stripe groups `k` data shards with `m` parity shards spread across
//! devices; any `m` missing shards reconstruct from the survivors.
//! Parity is Reed-Solomon over GF(2^8) with the AES irreducible
//! polynomial and a Vandermonde coefficient matrix.

use bch_error::{Error, Result};
use bch_types::{DeviceIdx, ExtentPtr};
use serde::{Deserialize, Serialize};

// ── GF(256) arithmetic ─────────────────────────────────────────────────────

/// Log/exp tables over the generator 0x03, reduced by 0x11B.
mod gf256 {
    const LOG: [u8; 256] = {
        let mut table = [0_u8; 256];
        let mut val = 1_u32;
        let mut i = 0_u8;
        loop {
            table[val as usize] = i;
            val = (val << 1) ^ val;
            if val >= 256 {
                val ^= 0x11B;
            }
            i = i.wrapping_add(1);
            if i == 255 {
                break;
            }
        }
        table[0] = 0;
        table
    };

    #[allow(clippy::cast_possible_truncation)] // reduced below 256
    const EXP: [u8; 512] = {
        let mut table = [0_u8; 512];
        let mut val = 1_u32;
        let mut i = 0;
        while i < 512 {
            table[i] = val as u8;
            val = (val << 1) ^ val;
            if val >= 256 {
                val ^= 0x11B;
            }
            i += 1;
        }
        table
    };

    #[must_use]
    pub fn mul(a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }
        EXP[LOG[a as usize] as usize + LOG[b as usize] as usize]
    }

    #[must_use]
    pub fn inv(a: u8) -> u8 {
        assert_ne!(a, 0, "GF(256) inverse of zero is undefined");
        EXP[255 - LOG[a as usize] as usize]
    }

    /// `2^e` in the field.
    #[must_use]
    pub fn pow2(e: usize) -> u8 {
        let mut out = 1_u8;
        let mut i = 0;
        while i < e {
            out = mul(out, 2);
            i += 1;
        }
        out
    }
}

// ── Stripe description ─────────────────────────────────────────────────────

/// One shard's location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeShard {
    pub dev: DeviceIdx,
    /// Device offset in sectors.
    pub offset: u64,
}

/// A stripe: geometry plus shard locations, data shards first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stripe {
    pub idx: u64,
    pub data_shards: u8,
    pub parity_shards: u8,
    /// Shard payload size in sectors.
    pub shard_sectors: u32,
    pub shards: Vec<StripeShard>,
}

impl Stripe {
    #[must_use]
    pub fn total_shards(&self) -> usize {
        usize::from(self.data_shards) + usize::from(self.parity_shards)
    }

    /// The pointer an extent stores to reference shard `block`.
    #[must_use]
    pub fn shard_ptr(&self, block: u8) -> Option<ExtentPtr> {
        self.shards.get(usize::from(block)).map(|s| ExtentPtr {
            dev: s.dev,
            offset: s.offset,
            gen: bch_types::Gen(0),
            cached: false,
        })
    }
}

/// Vandermonde row coefficient for parity row `row`, data column
/// `col`: `(2^row)^col`.
fn coefficient(row: usize, col: usize) -> u8 {
    let base = gf256::pow2(row);
    let mut out = 1_u8;
    for _ in 0..col {
        out = gf256::mul(out, base);
    }
    out
}

/// Compute `m` parity shards over `k` equal-length data shards.
pub fn encode_parity(data: &[Vec<u8>], parity_shards: u8) -> Result<Vec<Vec<u8>>> {
    let k = data.len();
    if k == 0 {
        return Err(Error::InvalidArgument("stripe with no data shards".into()));
    }
    let len = data[0].len();
    if data.iter().any(|d| d.len() != len) {
        return Err(Error::InvalidArgument(
            "stripe shards must be equal length".into(),
        ));
    }

    let mut parity = vec![vec![0_u8; len]; usize::from(parity_shards)];
    for (row, out) in parity.iter_mut().enumerate() {
        for (col, shard) in data.iter().enumerate() {
            let c = coefficient(row, col);
            if c == 0 {
                continue;
            }
            for (o, &b) in out.iter_mut().zip(shard.iter()) {
                *o ^= gf256::mul(c, b);
            }
        }
    }
    Ok(parity)
}

/// Reconstruct the missing data shards of a stripe.
///
/// `shards[i]` is `Some` for present shards (data rows `0..k`, parity
/// rows `k..k+m`), `None` for lost ones. Fails when more shards are
/// missing than parity can cover.
pub fn reconstruct(
    shards: &mut [Option<Vec<u8>>],
    data_shards: u8,
    parity_shards: u8,
) -> Result<()> {
    let k = usize::from(data_shards);
    let m = usize::from(parity_shards);
    if shards.len() != k + m {
        return Err(Error::InvalidArgument("stripe shard count mismatch".into()));
    }
    let missing_data: Vec<usize> = (0..k).filter(|&i| shards[i].is_none()).collect();
    if missing_data.is_empty() {
        return Ok(());
    }
    let available_parity: Vec<usize> = (k..k + m).filter(|&i| shards[i].is_some()).collect();
    if missing_data.len() > available_parity.len() {
        return Err(Error::Degraded(format!(
            "{} shards lost, only {} parity available",
            missing_data.len(),
            available_parity.len()
        )));
    }
    let len = shards
        .iter()
        .flatten()
        .map(Vec::len)
        .next()
        .ok_or_else(|| Error::InvalidArgument("no shards present".into()))?;

    // Build the linear system over the missing unknowns: for each used
    // parity row r, syndrome = parity_r XOR sum(known data * coeff).
    let rows = missing_data.len();
    let mut matrix = vec![vec![0_u8; rows]; rows];
    let mut rhs: Vec<Vec<u8>> = Vec::with_capacity(rows);
    for (ri, &pi) in available_parity.iter().take(rows).enumerate() {
        let prow = pi - k;
        let mut syndrome = shards[pi].clone().expect("parity shard present");
        for col in 0..k {
            if let Some(shard) = &shards[col] {
                let c = coefficient(prow, col);
                for (s, &b) in syndrome.iter_mut().zip(shard.iter()) {
                    *s ^= gf256::mul(c, b);
                }
            }
        }
        for (ci, &col) in missing_data.iter().enumerate() {
            matrix[ri][ci] = coefficient(prow, col);
        }
        rhs.push(syndrome);
    }

    // Gaussian elimination over GF(256).
    for pivot in 0..rows {
        let row_with_pivot = (pivot..rows)
            .find(|&r| matrix[r][pivot] != 0)
            .ok_or_else(|| Error::Degraded("stripe system is singular".into()))?;
        matrix.swap(pivot, row_with_pivot);
        rhs.swap(pivot, row_with_pivot);

        // Normalize the pivot row.
        let inv = gf256::inv(matrix[pivot][pivot]);
        for c in 0..rows {
            matrix[pivot][c] = gf256::mul(matrix[pivot][c], inv);
        }
        for b in rhs[pivot].iter_mut() {
            *b = gf256::mul(*b, inv);
        }

        // Eliminate the pivot column from every other row.
        let pivot_row = matrix[pivot].clone();
        let pivot_rhs = rhs[pivot].clone();
        for r in 0..rows {
            if r == pivot || matrix[r][pivot] == 0 {
                continue;
            }
            let factor = matrix[r][pivot];
            for c in 0..rows {
                matrix[r][c] ^= gf256::mul(factor, pivot_row[c]);
            }
            for (o, &b) in rhs[r].iter_mut().zip(pivot_rhs.iter()) {
                *o ^= gf256::mul(factor, b);
            }
        }
    }

    for (ci, &col) in missing_data.iter().enumerate() {
        let mut shard = rhs[ci].clone();
        shard.truncate(len);
        shards[col] = Some(shard);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bch_block::pattern_bytes;

    #[test]
    fn gf_mul_inverse() {
        for a in 1..=255_u8 {
            assert_eq!(gf256::mul(a, gf256::inv(a)), 1, "a={a}");
        }
    }

    #[test]
    fn parity_detects_and_repairs_single_loss() {
        let data: Vec<Vec<u8>> = (0..4_u8).map(|i| pattern_bytes(1024, i * 3 + 1)).collect();
        let parity = encode_parity(&data, 2).unwrap();

        for lost in 0..4 {
            let mut shards: Vec<Option<Vec<u8>>> = data
                .iter()
                .cloned()
                .map(Some)
                .chain(parity.iter().cloned().map(Some))
                .collect();
            shards[lost] = None;
            reconstruct(&mut shards, 4, 2).unwrap();
            assert_eq!(shards[lost].as_ref().unwrap(), &data[lost]);
        }
    }

    #[test]
    fn repairs_double_loss_with_two_parity() {
        let data: Vec<Vec<u8>> = (0..5_u8).map(|i| pattern_bytes(512, i + 9)).collect();
        let parity = encode_parity(&data, 2).unwrap();
        let mut shards: Vec<Option<Vec<u8>>> = data
            .iter()
            .cloned()
            .map(Some)
            .chain(parity.iter().cloned().map(Some))
            .collect();
        shards[1] = None;
        shards[3] = None;
        reconstruct(&mut shards, 5, 2).unwrap();
        assert_eq!(shards[1].as_ref().unwrap(), &data[1]);
        assert_eq!(shards[3].as_ref().unwrap(), &data[3]);
    }

    #[test]
    fn too_many_losses_is_degraded() {
        let data: Vec<Vec<u8>> = (0..4_u8).map(|i| pattern_bytes(256, i + 1)).collect();
        let parity = encode_parity(&data, 1).unwrap();
        let mut shards: Vec<Option<Vec<u8>>> = data
            .iter()
            .cloned()
            .map(Some)
            .chain(parity.iter().cloned().map(Some))
            .collect();
        shards[0] = None;
        shards[2] = None;
        assert!(matches!(
            reconstruct(&mut shards, 4, 1),
            Err(Error::Degraded(_))
        ));
    }

    #[test]
    fn unequal_shards_rejected() {
        let data = vec![vec![0_u8; 8], vec![0_u8; 9]];
        assert!(encode_parity(&data, 1).is_err());
    }
}
