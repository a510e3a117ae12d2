//! Sources of per-read CpG methylation calls for a genomic window
//!

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use error_stack::{Context, Report, ResultExt};
use ndarray::Array2;
use rust_htslib::bam::{self, Read};
use rust_htslib::htslib;

use crate::basemod::decode_cpg_meth_probs;
use crate::matrix::RawMatrix;

/// Base methylation probability at or above which a read is called methylated at a CpG
const METHYLATED_CALL_MIN_PROB: f32 = 0.5;

#[derive(Debug)]
pub struct ReadSourceError;

impl fmt::Display for ReadSourceError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("Error reading methylation calls from alignment file")
    }
}

impl Context for ReadSourceError {}

/// All CpG methylation calls from one read (or read pair) in a window
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadCpgCalls {
    pub qname: String,

    /// Key is the 0-indexed reference position of the forward-strand C of the CpG, value is 1 for
    /// methylated and 0 for unmethylated
    pub calls: BTreeMap<i64, u8>,
}

/// Provides per-read CpG methylation calls for genomic windows
///
pub trait ReadSource {
    /// Get methylation calls for all reads overlapping the 0-indexed half-closed window
    /// `[start, end)` on `chrom`
    ///
    /// Reads overlapping the window without any call in it are still returned, with empty calls.
    ///
    fn parse_reads(
        &mut self,
        chrom: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<ReadCpgCalls>, Report<ReadSourceError>>;

    /// Build the read-by-CpG matrix for a set of reads
    ///
    /// Columns are all CpG positions called in any read, in increasing position order. Reads
    /// without a call at a position are missing at that position.
    ///
    fn create_matrix(&self, reads: &[ReadCpgCalls]) -> RawMatrix {
        let positions = reads
            .iter()
            .flat_map(|x| x.calls.keys().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();

        let column_index = positions
            .iter()
            .enumerate()
            .map(|(i, &pos)| (pos, i))
            .collect::<HashMap<_, _>>();

        let mut calls = Array2::from_elem((reads.len(), positions.len()), None);
        for (row, read) in reads.iter().enumerate() {
            for (pos, &call) in read.calls.iter() {
                calls[[row, column_index[pos]]] = Some(call);
            }
        }

        RawMatrix { positions, calls }
    }
}

/// Bases to ignore at each end of a read when collecting methylation calls
///
/// Used to remove methylation bias at read ends. Read 1 settings also apply to unpaired reads.
///
#[derive(Clone, Debug, Default)]
pub struct MbiasTrim {
    pub read1_5: usize,
    pub read1_3: usize,
    pub read2_5: usize,
    pub read2_3: usize,
}

impl MbiasTrim {
    /// True if a call at `read_index` in the reference-oriented read sequence falls into the
    /// trimmed region at either end of the read
    fn is_trimmed(&self, record: &bam::Record, read_index: usize) -> bool {
        let (trim5, trim3) = if record.is_paired() && record.is_last_in_template() {
            (self.read2_5, self.read2_3)
        } else {
            (self.read1_5, self.read1_3)
        };

        let read_len = record.seq_len();
        let (dist5, dist3) = if record.is_reverse() {
            (read_len - 1 - read_index, read_index)
        } else {
            (read_index, read_len - 1 - read_index)
        };
        dist5 < trim5 || dist3 < trim3
    }
}

#[derive(Clone, Debug)]
pub struct BamReadSourceOptions {
    /// Minimum read mapping quality
    pub min_mapq: u8,

    pub mbias_trim: MbiasTrim,
}

/// Map each position in the stored read sequence to its 0-indexed reference position
///
fn get_read_to_ref_pos_map(record: &bam::Record) -> Vec<Option<i64>> {
    use rust_htslib::bam::record::Cigar::*;

    let mut read_to_ref = vec![None; record.seq_len()];
    let mut read_pos = 0usize;
    let mut ref_pos = record.pos();
    for c in record.cigar().iter() {
        match c {
            Diff(len) | Equal(len) | Match(len) => {
                for i in 0..*len as usize {
                    read_to_ref[read_pos + i] = Some(ref_pos + i as i64);
                }
                read_pos += *len as usize;
                ref_pos += *len as i64;
            }
            Ins(len) | SoftClip(len) => {
                read_pos += *len as usize;
            }
            Del(len) | RefSkip(len) => {
                ref_pos += *len as i64;
            }
            HardClip(_) | Pad(_) => {}
        }
    }
    read_to_ref
}

/// Check if the alignment record should be skipped entirely
///
fn filter_out_alignment_record(record: &bam::Record, min_mapq: u8) -> bool {
    static FLAG_FILTER: u32 =
        htslib::BAM_FUNMAP | htslib::BAM_FSECONDARY | htslib::BAM_FQCFAIL | htslib::BAM_FDUP;

    ((record.flags() as u32) & FLAG_FILTER) != 0 || record.mapq() < min_mapq
}

/// Get the CpG methylation calls of a single alignment within `[start, end)`
///
fn get_record_cpg_calls(
    record: &bam::Record,
    start: i64,
    end: i64,
    mbias_trim: &MbiasTrim,
) -> Result<BTreeMap<i64, u8>, Report<ReadSourceError>> {
    let mut calls = BTreeMap::new();
    let pos_prob = match decode_cpg_meth_probs(record).change_context(ReadSourceError)? {
        Some(x) => x,
        None => return Ok(calls),
    };

    let read_to_ref = get_read_to_ref_pos_map(record);
    for (&read_index, &prob) in pos_prob.iter() {
        if mbias_trim.is_trimmed(record, read_index) {
            continue;
        }
        let ref_pos = match read_to_ref.get(read_index) {
            Some(Some(x)) => *x,
            _ => continue,
        };
        if ref_pos < start || ref_pos >= end {
            continue;
        }
        let call = if prob >= METHYLATED_CALL_MIN_PROB { 1 } else { 0 };
        calls.insert(ref_pos, call);
    }
    Ok(calls)
}

/// Reads methylation calls from an indexed bam or cram file with MM/ML basemod tags
///
/// Each instance owns its own indexed reader, so instances are never shared between worker
/// threads.
///
pub struct BamReadSource {
    bam_reader: bam::IndexedReader,
    options: BamReadSourceOptions,
}

impl BamReadSource {
    pub fn new(
        bam_filename: &str,
        ref_filename: Option<&str>,
        options: &BamReadSourceOptions,
    ) -> Result<Self, Report<ReadSourceError>> {
        let mut bam_reader = bam::IndexedReader::from_path(bam_filename)
            .change_context(ReadSourceError)
            .attach_printable_lazy(|| format!("Failed to open alignment file '{bam_filename}'"))?;

        if let Some(ref_filename) = ref_filename {
            bam_reader
                .set_reference(ref_filename)
                .change_context(ReadSourceError)
                .attach_printable_lazy(|| {
                    format!("Failed to set reference '{ref_filename}' for '{bam_filename}'")
                })?;
        }

        Ok(Self {
            bam_reader,
            options: options.clone(),
        })
    }
}

impl ReadSource for BamReadSource {
    fn parse_reads(
        &mut self,
        chrom: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<ReadCpgCalls>, Report<ReadSourceError>> {
        let tid = self
            .bam_reader
            .header()
            .tid(chrom.as_bytes())
            .ok_or_else(|| Report::new(ReadSourceError))
            .attach_printable_lazy(|| format!("Chromosome '{chrom}' not found in alignment header"))?;

        self.bam_reader
            .fetch(bam::FetchDefinition::Region(tid as i32, start, end))
            .change_context(ReadSourceError)
            .attach_printable_lazy(|| format!("Failed to fetch region {chrom}:{}-{end}", start + 1))?;

        // Both reads of a pair are merged into one row, keeping the first call seen at each site
        let mut reads: Vec<ReadCpgCalls> = Vec::new();
        let mut qname_index = HashMap::new();

        let mut record = bam::Record::new();
        while let Some(r) = self.bam_reader.read(&mut record) {
            r.change_context(ReadSourceError)
                .attach_printable_lazy(|| format!("Failed to parse alignment record in {chrom}:{}-{end}", start + 1))?;

            if filter_out_alignment_record(&record, self.options.min_mapq) {
                continue;
            }

            let qname = String::from_utf8_lossy(record.qname()).to_string();
            let calls = get_record_cpg_calls(&record, start, end, &self.options.mbias_trim)
                .attach_printable_lazy(|| format!("Read: '{qname}'"))?;

            match qname_index.get(&qname) {
                Some(&index) => {
                    let read: &mut ReadCpgCalls = &mut reads[index];
                    for (pos, call) in calls {
                        read.calls.entry(pos).or_insert(call);
                    }
                }
                None => {
                    qname_index.insert(qname.clone(), reads.len());
                    reads.push(ReadCpgCalls { qname, calls });
                }
            }
        }
        Ok(reads)
    }
}
