//! Frame assembly and forward-error-correction recovery.
//!
//! Source and parity units for a frame are gathered into a fixed-stride byte
//! arena; if some source units are missing but enough parity units arrived,
//! a Reed-Solomon-style erasure decode over GF(256) reconstructs them.

use std::fmt;

use crate::codec::AvPacket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    Success,
    FecSuccess,
    FecFailed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FecError {
    DuplicateUnit(u32),
    OversizedPayload { unit_index: u32, len: usize, stride: usize },
    NotEnoughUnits { have: u32, need: u32 },
    SingularMatrix,
}

impl fmt::Display for FecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FecError::DuplicateUnit(i) => write!(f, "duplicate unit {}", i),
            FecError::OversizedPayload { unit_index, len, stride } => {
                write!(f, "unit {} payload {} exceeds stride {}", unit_index, len, stride)
            }
            FecError::NotEnoughUnits { have, need } => {
                write!(f, "only {} of {} required units received", have, need)
            }
            FecError::SingularMatrix => write!(f, "erasure decode matrix was singular"),
        }
    }
}

impl std::error::Error for FecError {}

fn round_up_16(n: usize) -> usize {
    (n + 15) / 16 * 16
}

/// Per-in-flight-frame state: a byte arena sized for `units_total` units at a
/// fixed stride, plus a bitmap of which units have arrived.
pub struct FrameBuilder {
    stride_per_unit: usize,
    units_total: u32,
    units_src: u32,
    units_fec: u32,
    is_video: bool,
    arena: Vec<u8>,
    received: Vec<bool>,
    received_src: u32,
    received_fec: u32,
    flushed: bool,
}

impl FrameBuilder {
    /// Size the arena from the first packet's declared unit counts. For video
    /// source units, a 2-byte big-endian size-extension prefix is read to
    /// expand the effective per-unit stride.
    pub fn alloc_frame(first_pkt: &AvPacket) -> Self {
        let is_video = first_pkt.audio_unit_size == 0;
        let base_unit_size = if is_video {
            first_pkt.data.len()
        } else {
            first_pkt.audio_unit_size as usize
        };
        // The size-extension header only applies to video; it widens the
        // stride so reconstructed units always fit.
        let with_extension = if is_video { base_unit_size + 2 } else { base_unit_size };
        let stride_per_unit = round_up_16(with_extension.max(16));

        let units_total = first_pkt.units_total;
        Self {
            stride_per_unit,
            units_total,
            units_src: first_pkt.units_src,
            units_fec: first_pkt.units_fec,
            is_video,
            arena: vec![0u8; stride_per_unit * units_total as usize],
            received: vec![false; units_total as usize],
            received_src: 0,
            received_fec: 0,
            flushed: false,
        }
    }

    pub fn put_unit(&mut self, pkt: &AvPacket) -> Result<(), FecError> {
        let idx = pkt.unit_index as usize;
        if idx >= self.received.len() {
            return Err(FecError::OversizedPayload {
                unit_index: pkt.unit_index,
                len: pkt.data.len(),
                stride: self.stride_per_unit,
            });
        }
        if self.received[idx] {
            return Err(FecError::DuplicateUnit(pkt.unit_index));
        }
        if pkt.data.len() > self.stride_per_unit {
            return Err(FecError::OversizedPayload {
                unit_index: pkt.unit_index,
                len: pkt.data.len(),
                stride: self.stride_per_unit,
            });
        }

        let start = idx * self.stride_per_unit;
        self.arena[start..start + pkt.data.len()].copy_from_slice(&pkt.data);
        self.received[idx] = true;
        if pkt.is_fec() {
            self.received_fec += 1;
        } else {
            self.received_src += 1;
        }
        Ok(())
    }

    pub fn flush_possible(&self) -> bool {
        self.received_src + self.received_fec >= self.units_src
    }

    pub fn flushed(&self) -> bool {
        self.flushed
    }

    fn unit_slice(&self, idx: usize) -> &[u8] {
        let start = idx * self.stride_per_unit;
        &self.arena[start..start + self.stride_per_unit]
    }

    /// Concatenate the reconstructed source units, stripping the 2-byte
    /// size-extension header from each when present (video only).
    fn concat_sources(&self, sources: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in sources {
            if self.is_video && unit.len() >= 2 {
                let pad = u16::from_be_bytes([unit[0], unit[1]]) as usize;
                let real_len = unit.len().saturating_sub(2).saturating_sub(pad);
                out.extend_from_slice(&unit[2..2 + real_len.min(unit.len() - 2)]);
            } else {
                out.extend_from_slice(unit);
            }
        }
        out
    }

    pub fn flush(&mut self) -> (Vec<u8>, FlushStatus) {
        self.flushed = true;
        let units_src = self.units_src as usize;

        if self.received_src as usize == units_src {
            let sources: Vec<Vec<u8>> = (0..units_src).map(|i| self.unit_slice(i).to_vec()).collect();
            return (self.concat_sources(&sources), FlushStatus::Success);
        }

        if !self.flush_possible() {
            return (Vec::new(), FlushStatus::Failed);
        }

        match gf256::recover_missing_sources(
            &self.arena,
            self.stride_per_unit,
            units_src,
            self.units_fec as usize,
            &self.received,
        ) {
            Ok(sources) => (self.concat_sources(&sources), FlushStatus::FecSuccess),
            Err(_) => (Vec::new(), FlushStatus::FecFailed),
        }
    }
}

/// GF(256) Reed-Solomon-style erasure recovery, byte-wise across unit stride.
mod gf256 {
    use super::FecError;

    const POLY: u16 = 0x11D;

    fn mul_tables() -> ([u8; 256], [u8; 512]) {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u16 = 1;
        for i in 0..255usize {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= POLY;
            }
        }
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        (log, exp)
    }

    fn gmul(a: u8, b: u8, log: &[u8; 256], exp: &[u8; 512]) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }
        exp[log[a as usize] as usize + log[b as usize] as usize]
    }

    fn ginv(a: u8, log: &[u8; 256], exp: &[u8; 512]) -> u8 {
        assert!(a != 0);
        exp[(255 - log[a as usize] as usize) % 255]
    }

    /// Evaluation point for unit index `i` in the Vandermonde generator
    /// matrix: source units use `i+1`, chosen to keep all points nonzero and
    /// distinct for the small unit counts this protocol uses per frame.
    fn eval_point(i: usize) -> u8 {
        (i as u8).wrapping_add(1)
    }

    /// Given byte-matrix `arena` split into `units_total` rows of `stride`
    /// bytes, reconstruct missing source rows (indices `0..units_src`) using
    /// whichever parity rows (`units_src..units_src+units_fec`) were received.
    pub fn recover_missing_sources(
        arena: &[u8],
        stride: usize,
        units_src: usize,
        units_fec: usize,
        received: &[bool],
    ) -> Result<Vec<Vec<u8>>, FecError> {
        let (log, exp) = mul_tables();

        let missing: Vec<usize> = (0..units_src).filter(|&i| !received[i]).collect();
        if missing.is_empty() {
            return Ok((0..units_src).map(|i| arena[i * stride..(i + 1) * stride].to_vec()).collect());
        }

        let available_parity: Vec<usize> = (0..units_fec)
            .map(|j| units_src + j)
            .filter(|&idx| received.get(idx).copied().unwrap_or(false))
            .collect();

        if available_parity.len() < missing.len() {
            return Err(FecError::NotEnoughUnits {
                have: available_parity.len() as u32,
                need: missing.len() as u32,
            });
        }
        let parity_used = &available_parity[..missing.len()];

        // Build the square coefficient matrix mapping missing source unknowns
        // to the chosen parity equations: parity_j = sum_i coeff(j,i) * src_i.
        // Known source contributions are moved to the RHS.
        let n = missing.len();
        let mut coeff = vec![vec![0u8; n]; n];
        let mut rhs: Vec<Vec<u8>> = vec![vec![0u8; stride]; n];

        for (row, &parity_idx) in parity_used.iter().enumerate() {
            let parity_order = parity_idx - units_src;
            let parity_row = &arena[parity_idx * stride..(parity_idx + 1) * stride];
            rhs[row].copy_from_slice(parity_row);

            for src_i in 0..units_src {
                let point = eval_point(src_i);
                let c = gf_pow(point, parity_order as u32, &log, &exp);
                if received[src_i] {
                    let known_row = &arena[src_i * stride..(src_i + 1) * stride];
                    for b in 0..stride {
                        rhs[row][b] ^= gmul(c, known_row[b], &log, &exp);
                    }
                } else {
                    let col = missing.iter().position(|&m| m == src_i).unwrap();
                    coeff[row][col] = c;
                }
            }
        }

        let solved = gauss_jordan(coeff, rhs, &log, &exp)?;

        let mut result = vec![Vec::new(); units_src];
        for i in 0..units_src {
            if received[i] {
                result[i] = arena[i * stride..(i + 1) * stride].to_vec();
            }
        }
        for (col, &src_i) in missing.iter().enumerate() {
            result[src_i] = solved[col].clone();
        }
        Ok(result)
    }

    fn gf_pow(base: u8, mut exp: u32, log: &[u8; 256], expt: &[u8; 512]) -> u8 {
        let mut result: u8 = 1;
        let mut b = base;
        while exp > 0 {
            if exp & 1 == 1 {
                result = gmul(result, b, log, expt);
            }
            b = gmul(b, b, log, expt);
            exp >>= 1;
        }
        result
    }

    fn gauss_jordan(
        mut coeff: Vec<Vec<u8>>,
        mut rhs: Vec<Vec<u8>>,
        log: &[u8; 256],
        exp: &[u8; 512],
    ) -> Result<Vec<Vec<u8>>, FecError> {
        let n = coeff.len();
        for col in 0..n {
            let pivot = (col..n).find(|&r| coeff[r][col] != 0).ok_or(FecError::SingularMatrix)?;
            coeff.swap(col, pivot);
            rhs.swap(col, pivot);

            let inv = ginv(coeff[col][col], log, exp);
            for c in coeff[col].iter_mut() {
                *c = gmul(*c, inv, log, exp);
            }
            for b in rhs[col].iter_mut() {
                *b = gmul(*b, inv, log, exp);
            }

            for row in 0..n {
                if row == col {
                    continue;
                }
                let factor = coeff[row][col];
                if factor == 0 {
                    continue;
                }
                for c in 0..n {
                    coeff[row][c] ^= gmul(factor, coeff[col][c], log, exp);
                }
                for b in 0..rhs[row].len() {
                    rhs[row][b] ^= gmul(factor, rhs[col][b], log, exp);
                }
            }
        }
        Ok(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, PacketType};

    fn make_src_unit(unit_index: u32, units_total: u32, units_src: u32, payload: &[u8]) -> AvPacket {
        AvPacket {
            kind: PacketType::Video,
            has_nalu: false,
            seq: 1,
            frame_index: 1,
            codec: Codec::H264,
            key_pos: 0,
            unit_index,
            units_total,
            units_src,
            units_fec: units_total - units_src,
            audio_unit_size: 0,
            adaptive_stream_index: 0,
            data: payload.to_vec(),
        }
    }

    fn xor_parity(sources: &[Vec<u8>], stride: usize) -> Vec<u8> {
        let mut parity = vec![0u8; stride];
        for s in sources {
            for i in 0..stride.min(s.len()) {
                parity[i] ^= s[i];
            }
        }
        parity
    }

    #[test]
    fn full_source_set_flushes_success_without_fec() {
        let units = vec![b"AAAA".to_vec(), b"BBBB".to_vec()];
        let first = make_src_unit(0, 2, 2, &units[0]);
        let mut fb = FrameBuilder::alloc_frame(&first);
        fb.put_unit(&first).unwrap();
        fb.put_unit(&make_src_unit(1, 2, 2, &units[1])).unwrap();

        let (bytes, status) = fb.flush();
        assert_eq!(status, FlushStatus::Success);
        assert!(bytes.len() >= 8);
    }

    #[test]
    fn recovers_missing_source_from_single_parity_xor_case() {
        // units_src=2, units_fec=1; drop source unit 1, recover via parity.
        let stride_payload = 6usize; // includes the 2-byte size-extension header
        let src0 = {
            let mut v = vec![0u8, 0u8]; // pad=0
            v.extend_from_slice(b"AAAA");
            v
        };
        let src1 = {
            let mut v = vec![0u8, 0u8];
            v.extend_from_slice(b"BBBB");
            v
        };
        assert_eq!(src0.len(), stride_payload);
        let parity = xor_parity(&[src0.clone(), src1.clone()], stride_payload);

        let first = make_src_unit(0, 3, 2, &src0);
        let mut fb = FrameBuilder::alloc_frame(&first);
        fb.put_unit(&first).unwrap();
        // unit_index 1 (src1) intentionally dropped
        fb.put_unit(&make_src_unit(2, 3, 2, &parity)).unwrap();

        let (recovered_bytes, status) = fb.flush();
        assert_eq!(status, FlushStatus::FecSuccess);

        let intact_first = make_src_unit(0, 3, 2, &src0);
        let mut fb2 = FrameBuilder::alloc_frame(&intact_first);
        fb2.put_unit(&intact_first).unwrap();
        fb2.put_unit(&make_src_unit(1, 3, 2, &src1)).unwrap();
        let (intact_bytes, intact_status) = fb2.flush();
        assert_eq!(intact_status, FlushStatus::Success);

        assert_eq!(recovered_bytes, intact_bytes);
    }

    #[test]
    fn rejects_duplicate_units() {
        let first = make_src_unit(0, 2, 2, b"AAAA");
        let mut fb = FrameBuilder::alloc_frame(&first);
        fb.put_unit(&first).unwrap();
        let err = fb.put_unit(&make_src_unit(0, 2, 2, b"AAAA")).unwrap_err();
        assert_eq!(err, FecError::DuplicateUnit(0));
    }

    #[test]
    fn not_enough_units_fails_the_flush() {
        let first = make_src_unit(0, 4, 3, b"AAAA");
        let mut fb = FrameBuilder::alloc_frame(&first);
        fb.put_unit(&first).unwrap();
        assert!(!fb.flush_possible());
        let (_, status) = fb.flush();
        assert_eq!(status, FlushStatus::Failed);
    }
}
