//! Decode 5mC CpG methylation from bam record MM/ML tags
//!

use std::collections::BTreeMap;
use std::fmt;

use error_stack::{Context, Report, ResultExt};
use rust_htslib::bam::{self, record::Aux};

#[derive(Debug)]
pub struct BasemodTagError;

impl fmt::Display for BasemodTagError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("Unexpected MM/ML basemod tag format")
    }
}

impl Context for BasemodTagError {}

/// Get an aux tag from the record, accepting either the standard or the older lower-case form
fn get_basemod_tag<'a>(record: &'a bam::Record, tag: &[u8], legacy_tag: &[u8]) -> Option<Aux<'a>> {
    record.aux(tag).or_else(|_| record.aux(legacy_tag)).ok()
}

fn base_comp(b: u8) -> u8 {
    match b {
        b'A' => b'T',
        b'T' => b'A',
        b'C' => b'G',
        b'G' => b'C',
        _ => b'N',
    }
}

/// Convert an ML tag value into the midpoint of its probability bin
pub fn decode_ml(ml: u8) -> f32 {
    ((ml as f64 + 0.5) / 256.0) as f32
}

/// Find the 5mC skip offsets in the MM tag, and the index of the first corresponding ML value
///
fn parse_5mc_offsets(mm_tag: &str) -> Result<Option<(Vec<usize>, usize)>, Report<BasemodTagError>> {
    let mut ml_offset = 0;
    for mm_segment in mm_tag.split(';').filter(|x| !x.is_empty()) {
        let mut mm_iter = mm_segment.split(',');
        let word = mm_iter.next().unwrap_or_default();
        if word.starts_with("C+m") {
            let offsets = mm_iter
                .map(|n| n.parse::<usize>())
                .collect::<Result<Vec<_>, _>>()
                .change_context(BasemodTagError)
                .attach_printable_lazy(|| format!("Invalid 5mC skip offset in MM tag: '{mm_tag}'"))?;
            return Ok(Some((offsets, ml_offset)));
        }
        ml_offset += mm_iter.count();
    }
    Ok(None)
}

/// Return the methylation probability of each CpG in the read which has a 5mC call
///
/// Keys of the returned map are read positions of the forward-strand C base of the CpG, so that
/// they can be matched to the alignment. For reverse-strand reads the methylation observation is
/// shifted from the G to the C of the CpG. Only C+m entries are used, other modifications are
/// skipped.
///
/// Returns `None` when the record has no usable 5mC information: missing or blank MM/ML tags, no
/// 5mC entry, or no 5mC call in a CpG context.
///
pub fn decode_cpg_meth_probs(
    record: &bam::Record,
) -> Result<Option<BTreeMap<usize, f32>>, Report<BasemodTagError>> {
    let qname = || String::from_utf8_lossy(record.qname()).to_string();

    let (mm_tag, ml_tag) = match (
        get_basemod_tag(record, b"MM", b"Mm"),
        get_basemod_tag(record, b"ML", b"Ml"),
    ) {
        (Some(mm), Some(ml)) => (mm, ml),
        _ => return Ok(None),
    };

    let mm_tag = match mm_tag {
        Aux::String(x) => x,
        _ => {
            return Err(Report::new(BasemodTagError)
                .attach_printable(format!("MM tag is not a string in read '{}'", qname())));
        }
    };

    let (offsets, ml_offset) = match parse_5mc_offsets(mm_tag)
        .attach_printable_lazy(|| format!("Read: '{}'", qname()))?
    {
        Some(x) if !x.0.is_empty() => x,
        _ => return Ok(None),
    };

    let ml_vals = match ml_tag {
        Aux::ArrayU8(x) => x
            .iter()
            .skip(ml_offset)
            .take(offsets.len())
            .collect::<Vec<_>>(),
        _ => {
            return Err(Report::new(BasemodTagError)
                .attach_printable(format!("ML tag is not a u8 array in read '{}'", qname())));
        }
    };

    if ml_vals.len() != offsets.len() {
        return Err(Report::new(BasemodTagError).attach_printable(format!(
            "C+m MM and ML counts disagree ({} vs {}) in read '{}'",
            offsets.len(),
            ml_vals.len(),
            qname()
        )));
    }

    // MM offsets are defined on the original sequencing orientation of the read
    let mut read = record.seq().as_bytes();
    if record.is_reverse() {
        read = read.into_iter().rev().map(base_comp).collect();
    }

    let mut c_positions = read
        .iter()
        .enumerate()
        .filter(|(_, &base)| base == b'C')
        .map(|(read_index, _)| read_index);
    let mut basemod_read_indexes = Vec::with_capacity(offsets.len());
    for &offset in offsets.iter() {
        match c_positions.nth(offset) {
            Some(x) => basemod_read_indexes.push(x),
            None => {
                return Err(Report::new(BasemodTagError).attach_printable(format!(
                    "Read sequence is too short for MM tag offsets in read '{}'",
                    qname()
                )));
            }
        }
    }

    let read_len = read.len();
    let mut pos_prob = BTreeMap::new();
    for (&read_index, &ml_val) in basemod_read_indexes.iter().zip(ml_vals.iter()) {
        if read_index + 1 >= read_len || read[read_index + 1] != b'G' {
            continue;
        }

        let ref_strand_read_index = if record.is_reverse() {
            // Flip from the G to the C index of the CpG on the forward strand
            read_len - (read_index + 1) - 1
        } else {
            read_index
        };
        pos_prob.insert(ref_strand_read_index, decode_ml(ml_val));
    }

    if pos_prob.is_empty() {
        Ok(None)
    } else {
        Ok(Some(pos_prob))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rust_htslib::bam::{header, Header, HeaderView};

    pub(crate) fn get_test_header() -> HeaderView {
        let mut header = Header::new();
        header.push_record(
            header::HeaderRecord::new(b"SQ")
                .push_tag(b"SN", "chr1")
                .push_tag(b"LN", 10000000),
        );
        HeaderView::from_header(&header)
    }

    fn decode_sam(sam_line: &[u8]) -> Result<Option<BTreeMap<usize, f32>>, Report<BasemodTagError>> {
        let rec = bam::Record::from_sam(&get_test_header(), sam_line).unwrap();
        decode_cpg_meth_probs(&rec)
    }

    #[test]
    fn test_decode_ml() {
        approx::assert_ulps_eq!(decode_ml(0), 1.0 / 512.0, max_ulps = 4);
        approx::assert_ulps_eq!(decode_ml(255), 511.0 / 512.0, max_ulps = 4);
    }

    #[test]
    fn test_no_usable_basemods() {
        // No MM/ML tags
        let info = decode_sam(b"qname\t4\t*\t0\t255\t*\t*\t0\t0\tACGCCGTATCGTCTCGAGGA\tDDDDDEEEEEDDDDDEEEEE");
        assert!(info.unwrap().is_none());

        // Blank MM tag
        let info = decode_sam(b"qname\t4\t*\t0\t255\t*\t*\t0\t0\tACGCCGTATCGTCTCGAGGA\tDDDDDEEEEEDDDDDEEEEE\tMM:Z:\tMl:B:C");
        assert!(info.unwrap().is_none());

        // 5mC entry without offsets
        let info = decode_sam(b"qname\t4\t*\t0\t255\t*\t*\t0\t0\tACGCCGTATCGTCTCGAGGA\tDDDDDEEEEEDDDDDEEEEE\tMM:Z:C+m;\tMl:B:C");
        assert!(info.unwrap().is_none());

        // Only non-5mC entries
        let info = decode_sam(b"qname\t4\t*\t0\t255\t*\t*\t0\t0\tACGCCGTATCGTCTCGAGGA\tDDDDDEEEEEDDDDDEEEEE\tMM:Z:A+m,1,0;\tMl:B:C,100,150");
        assert!(info.unwrap().is_none());
    }

    #[test]
    fn test_malformed_basemods() {
        // ML array too short for the 5mC offsets
        let info = decode_sam(b"qname\t4\t*\t0\t255\t*\t*\t0\t0\tACGCCGTATCGTCTCGAGGA\tDDDDDEEEEEDDDDDEEEEE\tMM:Z:C+m,0,1,1;\tMl:B:C,100");
        assert!(info.is_err());

        // More offsets than C bases in the read
        let info = decode_sam(b"qname\t4\t*\t0\t255\t*\t*\t0\t0\tACGT\tDDDD\tMM:Z:C+m,0,3;\tMl:B:C,100,100");
        assert!(info.is_err());

        // Non-numeric offset
        let info = decode_sam(b"qname\t4\t*\t0\t255\t*\t*\t0\t0\tACGT\tDDDD\tMM:Z:C+m,x;\tMl:B:C,100");
        assert!(info.is_err());
    }

    #[test]
    fn test_fwd_strand_cpg_probs() {
        // The third 5mC call is at a C not followed by G, so it is filtered out
        let info = decode_sam(b"qname\t0\tchr1\t10\t60\t20M\t*\t0\t0\tACGCCGTATCGTCTCGAGGA\tDDDDDEEEEEDDDDDEEEEE\tMM:Z:A+m,1,0;C+m?,0,1,1;\tMl:B:C,100,150,200,220,240")
            .unwrap()
            .unwrap();

        assert_eq!(info.keys().copied().collect::<Vec<_>>(), vec![1, 4]);
        approx::assert_ulps_eq!(info[&1], decode_ml(200), max_ulps = 4);
        approx::assert_ulps_eq!(info[&4], decode_ml(220), max_ulps = 4);
    }

    #[test]
    fn test_rev_strand_cpg_probs() {
        let info = decode_sam(b"qname\t16\tchr1\t10\t60\t20M\t*\t0\t0\tTCCTCGAGACGATACGGCGT\tEEEEEDDDDDEEEEEDDDDD\tMM:Z:A+m,1,0;C+m,0,1,1;\tMl:B:C,100,150,200,220,240")
            .unwrap()
            .unwrap();

        assert_eq!(info.keys().copied().collect::<Vec<_>>(), vec![14, 17]);
        approx::assert_ulps_eq!(info[&14], decode_ml(220), max_ulps = 4);
        approx::assert_ulps_eq!(info[&17], decode_ml(200), max_ulps = 4);
    }
}
