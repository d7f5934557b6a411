// ScanTools Module
// Charge-injection scan reader: header dialects, word codec, waveform records

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};

use crate::fitting::FitError;
use crate::formats::DataFormat;

/// Logical channels decoded per record.
pub const CHANNELS: usize = 16;

/// Channel groups in the 64-channel system; one group is decoded per file.
pub const GROUPS: usize = 4;

/// Data words per sample line: each word carries two channels.
const PAIRS: usize = CHANNELS / 2;

const SEPARATOR_LINES: usize = 2;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid datatype {datatype:?} for field '{field}' in dataformat version {version}")]
    Format {
        version: String,
        field: String,
        datatype: String,
    },

    #[error("Unknown data format: {0}")]
    UnknownFormat(String),

    #[error("Header parse error at line {line}: {reason} (raw: {content:?})")]
    HeaderParse {
        line: usize,
        reason: String,
        content: String,
    },

    #[error("Decode error at line {line}: invalid data word {token:?}")]
    Decode { line: usize, token: String },

    #[error("Record shape error at line {line}: {reason}")]
    RecordShape { line: usize, reason: String },

    #[error("Unexpected end of file after line {line} while reading {context}")]
    UnexpectedEof { line: usize, context: String },

    #[error("Pulse fit failed at step {step}, channel {channel}: {source}")]
    PulseFit {
        step: usize,
        channel: usize,
        #[source]
        source: FitError,
    },

    #[error("Calibration fit failed for channel {channel}: {source}")]
    CalibrationFit {
        channel: usize,
        #[source]
        source: FitError,
    },

    #[error("{}: {source}", .path.display())]
    InFile {
        path: PathBuf,
        #[source]
        source: Box<ScanError>,
    },
}

pub type Result<T> = std::result::Result<T, ScanError>;

impl ScanError {
    /// The innermost error, with any file context peeled off.
    pub fn root(&self) -> &ScanError {
        match self {
            ScanError::InFile { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn in_file(self, path: &Path) -> Self {
        match self {
            err @ ScanError::InFile { .. } => err,
            err => ScanError::InFile {
                path: path.to_path_buf(),
                source: Box::new(err),
            },
        }
    }

    fn header(line: usize, reason: impl Into<String>, content: impl Into<String>) -> Self {
        ScanError::HeaderParse {
            line,
            reason: reason.into(),
            content: content.into(),
        }
    }
}

/// Split one encoded data word into its `(low, high)` samples.
///
/// A word is a 32-bit hexadecimal value with an optional `0x` prefix. The low
/// sample lives in bits 0-15, the high sample in bits 16-31.
pub fn split_word(token: &str) -> Option<(u16, u16)> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);

    if digits.is_empty() || digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }

    let word = u32::from_str_radix(digits, 16).ok()?;
    Some(((word & 0xffff) as u16, (word >> 16) as u16))
}

/// Inverse of [`split_word`], in the canonical 8-digit form.
pub fn join_word(low: u16, high: u16) -> String {
    format!("{:08x}", (u32::from(high) << 16) | u32::from(low))
}

/// Forward-only line reader that keeps track of the current line number.
pub struct LineReader<'a> {
    inner: Box<dyn BufRead + 'a>,
    line: usize,
    buf: String,
}

impl<'a> LineReader<'a> {
    pub fn new(inner: impl BufRead + 'a) -> Self {
        LineReader {
            inner: Box::new(inner),
            line: 0,
            buf: String::new(),
        }
    }

    /// Number of lines consumed so far (1-based number of the last line read).
    pub fn line_number(&self) -> usize {
        self.line
    }

    /// Next line without its terminator, `None` at end of stream.
    pub fn next_line(&mut self) -> Result<Option<&str>> {
        self.buf.clear();
        if self.inner.read_line(&mut self.buf)? == 0 {
            return Ok(None);
        }
        self.line += 1;
        let trimmed = self.buf.trim_end_matches(['\n', '\r']).len();
        self.buf.truncate(trimmed);
        Ok(Some(&self.buf))
    }

    /// Next line; end of stream is an error naming what was being read.
    pub fn expect_line(&mut self, context: &str) -> Result<&str> {
        let line = self.line;
        match self.next_line()? {
            Some(text) => Ok(text),
            None => Err(ScanError::UnexpectedEof {
                line,
                context: context.to_string(),
            }),
        }
    }

    pub fn discard(&mut self, count: usize, context: &str) -> Result<()> {
        for _ in 0..count {
            self.expect_line(context)?;
        }
        Ok(())
    }

    /// Read one header line, trimmed. In strict mode an empty line is rejected.
    pub fn read_config_line(&mut self, strict: bool) -> Result<String> {
        let line = self.line;
        let text = match self.next_line()? {
            Some(text) => text.trim().to_string(),
            None => return Err(ScanError::header(line, "unexpected end of file in header", "")),
        };
        if strict && text.is_empty() {
            return Err(ScanError::header(self.line, "empty header line", text));
        }
        Ok(text)
    }

    fn read_header_int(&mut self, field: &str) -> Result<usize> {
        let text = self.read_config_line(true)?;
        text.parse::<usize>().map_err(|e| {
            ScanError::header(self.line, format!("field '{}' is not an integer: {}", field, e), text)
        })
    }
}

/// Scan geometry as declared by the file header.
#[derive(Default, Clone, Debug, PartialEq)]
pub struct ScanGeometry {
    /// First channel of the decoded block in the 64-channel system.
    pub offset: usize,
    pub n_steps: usize,
    pub n_trials: usize,
    pub n_samples: usize,
    /// Every header field as read, keyed by its dialect-specific name.
    pub version_fields: BTreeMap<String, String>,
}

impl ScanGeometry {
    pub fn group(&self) -> usize {
        self.offset / CHANNELS
    }

    /// Lines of lower channel groups preceding the decoded block in each record.
    pub fn front_skip(&self) -> usize {
        self.group() * self.n_samples
    }

    /// Lines of higher channel groups following the decoded block in each record.
    pub fn back_skip(&self) -> usize {
        (GROUPS - 1 - self.group()) * self.n_samples
    }

    fn validate(&self, line: usize) -> Result<()> {
        if self.group() >= GROUPS {
            return Err(ScanError::header(
                line,
                format!("channel offset {} outside the {}-channel system", self.offset, GROUPS * CHANNELS),
                self.offset.to_string(),
            ));
        }
        for (name, value) in [
            ("step count", self.n_steps),
            ("trial count", self.n_trials),
            ("sample count", self.n_samples),
        ] {
            if value == 0 {
                return Err(ScanError::header(line, format!("{} must be positive", name), "0"));
            }
        }
        let total = [self.n_trials, CHANNELS, self.n_samples]
            .iter()
            .try_fold(self.n_steps, |acc, &n| acc.checked_mul(n));
        if total.is_none() || GROUPS.checked_mul(self.n_samples).is_none() {
            return Err(ScanError::header(
                line,
                "step, trial and sample counts overflow the sample index",
                format!("{} x {} x {}", self.n_steps, self.n_trials, self.n_samples),
            ));
        }
        Ok(())
    }
}

/// A decoded header plus how many separator lines precede the first record.
#[derive(Default, Clone, Debug, PartialEq)]
pub struct ScanHeader {
    pub geometry: ScanGeometry,
    pub first_lead_in: usize,
}

/// v1: label, channel offset, four ignored lines, then steps, trials,
/// data steps and samples, one value per line.
pub fn read_header_v1(reader: &mut LineReader<'_>) -> Result<ScanHeader> {
    let mut fields = BTreeMap::new();

    let label = reader.read_config_line(true)?;
    fields.insert("label".to_string(), label);

    let offset = reader.read_header_int("offset")?;
    reader.discard(4, "v1 header")?;
    let n_steps = reader.read_header_int("nstep")?;
    let n_trials = reader.read_header_int("nstep_event")?;
    let nstep_data = reader.read_header_int("nstep_data")?;
    let n_samples = reader.read_header_int("nsample")?;

    // nstep_data is carried for the entry record only
    debug!(nstep_data, "v1 header: nstep_data not used by the fit");

    for (key, value) in [
        ("offset", offset),
        ("nstep", n_steps),
        ("nstep_event", n_trials),
        ("nstep_data", nstep_data),
        ("nsample", n_samples),
    ] {
        fields.insert(key.to_string(), value.to_string());
    }

    let geometry = ScanGeometry {
        offset,
        n_steps,
        n_trials,
        n_samples,
        version_fields: fields,
    };
    geometry.validate(reader.line_number())?;

    Ok(ScanHeader {
        geometry,
        first_lead_in: SEPARATOR_LINES,
    })
}

/// v2: `KEY:VALUE` lines up to the first line without a colon. That line is
/// the first separator of the first record, so one fewer is left to skip.
pub fn read_header_v2(reader: &mut LineReader<'_>) -> Result<ScanHeader> {
    let mut fields = BTreeMap::new();

    let mut line = reader.read_config_line(false)?;
    while let Some((key, value)) = line.split_once(':') {
        fields.insert(key.trim().to_string(), value.trim().to_string());
        line = reader.read_config_line(false)?;
    }
    let end = reader.line_number();

    require_key(&fields, "BOARDID", end, &line)?;
    let offset = require_int(&fields, "CHANNELMIN", end, &line)?;
    let n_steps = require_int(&fields, "NUMBEROFSTEPS", end, &line)?;
    let n_trials = require_int(&fields, "EVENTSPERSTEP", end, &line)?;
    require_int(&fields, "DACPERSTEP", end, &line)?;
    let n_samples = require_int(&fields, "NSAMPLES", end, &line)?;

    let geometry = ScanGeometry {
        offset,
        n_steps,
        n_trials,
        n_samples,
        version_fields: fields,
    };
    geometry.validate(end)?;

    Ok(ScanHeader {
        geometry,
        first_lead_in: SEPARATOR_LINES - 1,
    })
}

fn require_key<'m>(fields: &'m BTreeMap<String, String>, key: &str, line: usize, terminator: &str) -> Result<&'m str> {
    fields
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| ScanError::header(line, format!("missing required key {}", key), terminator))
}

fn require_int(fields: &BTreeMap<String, String>, key: &str, line: usize, terminator: &str) -> Result<usize> {
    let value = require_key(fields, key, line, terminator)?;
    value
        .parse::<usize>()
        .map_err(|e| ScanError::header(line, format!("key {} is not an integer: {}", key, e), value))
}

/// Decoded ADC samples laid out as `[step][trial][channel][sample]`.
#[derive(Default, Clone, Debug, PartialEq)]
pub struct RawWaveforms {
    pub n_steps: usize,
    pub n_trials: usize,
    pub n_samples: usize,
    pub samples: Vec<u16>,
}

impl RawWaveforms {
    pub fn shape(&self) -> [usize; 4] {
        [self.n_steps, self.n_trials, CHANNELS, self.n_samples]
    }

    /// Samples of one channel in one trial.
    pub fn waveform(&self, step: usize, trial: usize, channel: usize) -> Option<&[u16]> {
        if step >= self.n_steps || trial >= self.n_trials || channel >= CHANNELS {
            return None;
        }
        let start = step
            .checked_mul(self.n_trials)?
            .checked_add(trial)?
            .checked_mul(CHANNELS)?
            .checked_add(channel)?
            .checked_mul(self.n_samples)?;
        self.samples.get(start..start.checked_add(self.n_samples)?)
    }

    /// Leading steps whose records are all present in `samples`.
    pub fn complete_steps(&self) -> usize {
        self.n_trials
            .checked_mul(CHANNELS)
            .and_then(|n| n.checked_mul(self.n_samples))
            .filter(|&per_step| per_step > 0)
            .map_or(0, |per_step| (self.samples.len() / per_step).min(self.n_steps))
    }

    pub fn get(&self, step: usize, trial: usize, channel: usize, sample: usize) -> Option<u16> {
        self.waveform(step, trial, channel)?.get(sample).copied()
    }
}

/// Read every `(step, trial)` record that follows the header.
pub fn read_waveforms(reader: &mut LineReader<'_>, header: &ScanHeader) -> Result<RawWaveforms> {
    let geometry = &header.geometry;
    let n_samples = geometry.n_samples;
    let (front, back) = (geometry.front_skip(), geometry.back_skip());

    let mut waveforms = RawWaveforms {
        n_steps: geometry.n_steps,
        n_trials: geometry.n_trials,
        n_samples,
        // grown record by record; the header counts are not trusted for allocation
        samples: Vec::new(),
    };

    let mut words: Vec<(u16, u16)> = Vec::new();

    for step in 0..geometry.n_steps {
        for trial in 0..geometry.n_trials {
            let lead_in = if step == 0 && trial == 0 {
                header.first_lead_in
            } else {
                SEPARATOR_LINES
            };
            reader.discard(lead_in, "record separator")?;
            reader.discard(front, "preceding channel groups")?;

            words.clear();
            for _ in 0..n_samples {
                let line = reader.line_number() + 1;
                let text = reader.expect_line("channel data")?;
                for token in text.split_whitespace() {
                    let word = split_word(token).ok_or_else(|| ScanError::Decode {
                        line,
                        token: token.to_string(),
                    })?;
                    words.push(word);
                }
            }

            if words.len() != PAIRS * n_samples {
                return Err(ScanError::RecordShape {
                    line: reader.line_number(),
                    reason: format!(
                        "step {} trial {}: expected {} data words, found {}",
                        step,
                        trial,
                        PAIRS * n_samples,
                        words.len()
                    ),
                });
            }

            // each chunk holds one channel pair: low half first, then high
            for chunk in words.chunks_exact(n_samples) {
                waveforms.samples.extend(chunk.iter().map(|&(low, _)| low));
                waveforms.samples.extend(chunk.iter().map(|&(_, high)| high));
            }

            reader.discard(back, "following channel groups")?;
            reader.discard(SEPARATOR_LINES, "record trailer")?;
            trace!(step, trial, "record decoded");
        }
    }

    Ok(waveforms)
}

/// A scan file: its path, header and decoded waveforms.
#[derive(Default, Debug)]
pub struct ScanFile {
    pub file_path: PathBuf,
    pub file_header: ScanHeader,
    pub waveforms: RawWaveforms,
}

impl ScanFile {
    /// Read only the header of a scan file.
    pub fn read_header<P: AsRef<Path>>(input_file: P, format: &dyn DataFormat) -> Result<ScanHeader> {
        let path = input_file.as_ref();
        let run = || -> Result<ScanHeader> {
            let mut reader = LineReader::new(BufReader::new(File::open(path)?));
            format.read_header(&mut reader)
        };
        run().map_err(|e| e.in_file(path))
    }

    /// Load and decode a whole scan file with the given format.
    pub fn load<P: AsRef<Path>>(input_file: P, format: &dyn DataFormat) -> Result<ScanFile> {
        let path = input_file.as_ref();
        let run = || -> Result<ScanFile> {
            let mut reader = LineReader::new(BufReader::new(File::open(path)?));
            let header = format.read_header(&mut reader)?;
            debug!(
                version = format.version(),
                offset = header.geometry.offset,
                steps = header.geometry.n_steps,
                trials = header.geometry.n_trials,
                samples = header.geometry.n_samples,
                "header parsed"
            );
            let waveforms = read_waveforms(&mut reader, &header)?;
            Ok(ScanFile {
                file_path: path.to_path_buf(),
                file_header: header,
                waveforms,
            })
        };
        run().map_err(|e| e.in_file(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{DataFormatV1, DataFormatV2};
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    /// Records for a block at `offset`, with `value(step, trial, channel, sample)`.
    fn write_records(
        out: &mut String,
        offset: usize,
        n_steps: usize,
        n_trials: usize,
        n_samples: usize,
        value: impl Fn(usize, usize, usize, usize) -> u16,
    ) {
        let group = offset / CHANNELS;
        let filler = vec!["00000000"; PAIRS].join(" ");
        for step in 0..n_steps {
            for trial in 0..n_trials {
                out.push_str(&format!("EVENT {} {}\n\n", step, trial));
                for _ in 0..group * n_samples {
                    out.push_str(&filler);
                    out.push('\n');
                }
                let mut tokens = Vec::new();
                for pair in 0..PAIRS {
                    for sample in 0..n_samples {
                        tokens.push(join_word(
                            value(step, trial, 2 * pair, sample),
                            value(step, trial, 2 * pair + 1, sample),
                        ));
                    }
                }
                for line in tokens.chunks(PAIRS) {
                    out.push_str(&line.join(" "));
                    out.push('\n');
                }
                for _ in 0..(GROUPS - 1 - group) * n_samples {
                    out.push_str(&filler);
                    out.push('\n');
                }
                out.push_str("\n\n");
            }
        }
    }

    fn v1_text(offset: usize, n_steps: usize, n_trials: usize, n_samples: usize) -> String {
        let mut text = format!(
            "board0x70\n{}\nignored\nignored\nignored\nignored\n{}\n{}\n{}\n{}\n",
            offset, n_steps, n_trials, 10, n_samples
        );
        write_records(&mut text, offset, n_steps, n_trials, n_samples, |st, tr, ch, s| {
            (1000 * st + 100 * tr + 10 * ch + s) as u16
        });
        text
    }

    fn v2_text(offset: usize, n_steps: usize, n_trials: usize, n_samples: usize) -> String {
        let mut text = format!(
            "BOARDID:0x70\nCHANNELMIN:{}\nNUMBEROFSTEPS:{}\nEVENTSPERSTEP:{}\nDACPERSTEP:25\nNSAMPLES:{}\nTESTERID:jdoe\n",
            offset, n_steps, n_trials, n_samples
        );
        write_records(&mut text, offset, n_steps, n_trials, n_samples, |st, tr, ch, s| {
            (1000 * st + 100 * tr + 10 * ch + s) as u16
        });
        text
    }

    fn reader(text: &str) -> LineReader<'_> {
        LineReader::new(Cursor::new(text.as_bytes()))
    }

    #[test]
    fn test_word_split() {
        assert_eq!(split_word("0001ffff"), Some((0xffff, 0x0001)));
        assert_eq!(split_word("0x12345678"), Some((0x5678, 0x1234)));
        assert_eq!(split_word("ABCD"), Some((0xabcd, 0)));
        assert_eq!(split_word(""), None);
        assert_eq!(split_word("0x"), None);
        assert_eq!(split_word("123456789"), None);
        assert_eq!(split_word("+1234"), None);
        assert_eq!(split_word("12g4"), None);
    }

    #[test]
    fn test_word_join_inverts_split() {
        for &(low, high) in &[(0u16, 0u16), (1, 0), (0, 1), (0xffff, 0xffff), (1500, 2900), (0x8000, 0x7fff)] {
            let token = join_word(low, high);
            assert_eq!(split_word(&token), Some((low, high)));
            assert_eq!(u32::from_str_radix(&token, 16).unwrap(), (u32::from(high) << 16) | u32::from(low));
        }
    }

    #[test]
    fn test_geometry_skips() {
        let geometry = ScanGeometry {
            offset: 32,
            n_steps: 1,
            n_trials: 1,
            n_samples: 28,
            ..Default::default()
        };
        assert_eq!(geometry.group(), 2);
        assert_eq!(geometry.front_skip(), 56);
        assert_eq!(geometry.back_skip(), 28);
    }

    #[test]
    fn test_header_v1() {
        let text = v1_text(16, 3, 2, 4);
        let header = read_header_v1(&mut reader(&text)).unwrap();

        assert_eq!(header.geometry.offset, 16);
        assert_eq!(header.geometry.n_steps, 3);
        assert_eq!(header.geometry.n_trials, 2);
        assert_eq!(header.geometry.n_samples, 4);
        assert_eq!(header.geometry.version_fields["label"], "board0x70");
        assert_eq!(header.geometry.version_fields["nstep_data"], "10");
        assert_eq!(header.first_lead_in, 2);
    }

    #[test]
    fn test_header_v1_rejects_text_in_integer_line() {
        let text = "board\nsixteen\n";
        let err = read_header_v1(&mut reader(text)).unwrap_err();
        assert!(matches!(err, ScanError::HeaderParse { line: 2, .. }), "{err}");
    }

    #[test]
    fn test_header_v2() {
        let text = v2_text(0, 5, 3, 4);
        let mut lines = reader(&text);
        let header = read_header_v2(&mut lines).unwrap();

        assert_eq!(header.geometry.n_steps, 5);
        assert_eq!(header.geometry.n_trials, 3);
        assert_eq!(header.geometry.version_fields["BOARDID"], "0x70");
        assert_eq!(header.geometry.version_fields["TESTERID"], "jdoe");
        assert_eq!(header.first_lead_in, 1);
        // the terminating separator line has been consumed
        assert_eq!(lines.line_number(), 8);
    }

    #[test]
    fn test_header_v2_missing_key() {
        let text = "BOARDID:0x70\nCHANNELMIN:0\nNUMBEROFSTEPS:5\nEVENTSPERSTEP:3\nDACPERSTEP:25\nEVENT 0 0\nzz\n";
        let err = read_header_v2(&mut reader(text)).unwrap_err();
        match err {
            ScanError::HeaderParse { reason, .. } => assert!(reason.contains("NSAMPLES"), "{reason}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_header_v2_bad_integer() {
        let text = "BOARDID:1\nCHANNELMIN:0\nNUMBEROFSTEPS:NA\nEVENTSPERSTEP:3\nDACPERSTEP:25\nNSAMPLES:4\n\n";
        let err = read_header_v2(&mut reader(text)).unwrap_err();
        match err {
            ScanError::HeaderParse { content, .. } => assert_eq!(content, "NA"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_header_rejects_offset_outside_system() {
        let text = "BOARDID:1\nCHANNELMIN:64\nNUMBEROFSTEPS:1\nEVENTSPERSTEP:1\nDACPERSTEP:1\nNSAMPLES:4\n\n";
        let err = read_header_v2(&mut reader(text)).unwrap_err();
        assert!(matches!(err, ScanError::HeaderParse { .. }));
    }

    #[test]
    fn test_header_rejects_overflowing_counts() {
        let text = "BOARDID:1\nCHANNELMIN:0\nNUMBEROFSTEPS:1000000000000\nEVENTSPERSTEP:1000000000\n\
                    DACPERSTEP:1\nNSAMPLES:4\n\n";
        let err = read_header_v2(&mut reader(text)).unwrap_err();
        assert!(
            matches!(err, ScanError::HeaderParse { ref reason, .. } if reason.contains("overflow")),
            "{err}"
        );
    }

    #[test]
    fn test_huge_counts_without_records_hit_eof() {
        // the product fits in usize, so only the missing records stop the read
        let text = "BOARDID:1\nCHANNELMIN:0\nNUMBEROFSTEPS:1000000000000\nEVENTSPERSTEP:1\n\
                    DACPERSTEP:1\nNSAMPLES:4\n\n";
        let mut lines = reader(text);
        let header = read_header_v2(&mut lines).unwrap();
        let err = read_waveforms(&mut lines, &header).unwrap_err();
        assert!(matches!(err, ScanError::UnexpectedEof { .. }), "{err}");
    }

    #[test]
    fn test_waveform_index_is_checked() {
        let raw = RawWaveforms {
            n_steps: usize::MAX,
            n_trials: usize::MAX,
            n_samples: 4,
            samples: vec![1; CHANNELS * 4],
        };
        assert_eq!(raw.waveform(0, 0, 3), Some(&[1, 1, 1, 1][..]));
        assert!(raw.waveform(5, 5, 0).is_none());
        assert_eq!(raw.complete_steps(), 0);
    }

    #[test]
    fn test_read_waveforms_v2() {
        let text = v2_text(0, 2, 3, 4);
        let mut lines = reader(&text);
        let header = read_header_v2(&mut lines).unwrap();
        let raw = read_waveforms(&mut lines, &header).unwrap();

        assert_eq!(raw.shape(), [2, 3, 16, 4]);
        assert_eq!(raw.get(1, 2, 15, 3), Some(1000 + 200 + 150 + 3));
        assert_eq!(raw.waveform(0, 1, 4).unwrap(), &[140, 141, 142, 143]);
        assert!(raw.waveform(2, 0, 0).is_none());
        assert!(lines.next_line().unwrap().is_none());
    }

    #[test]
    fn test_read_waveforms_skips_other_groups() {
        let text = v1_text(48, 2, 2, 3);
        let mut lines = reader(&text);
        let header = read_header_v1(&mut lines).unwrap();
        let raw = read_waveforms(&mut lines, &header).unwrap();

        assert_eq!(raw.shape(), [2, 2, 16, 3]);
        assert_eq!(raw.get(1, 1, 7, 2), Some(1000 + 100 + 70 + 2));
    }

    #[test]
    fn test_decode_error_reports_line() {
        let mut lines: Vec<String> = v2_text(0, 1, 1, 2).lines().map(str::to_string).collect();
        // 7 header lines, terminator, blank separator, then the data lines
        let mut tokens: Vec<&str> = lines[9].split(' ').collect();
        tokens[3] = "zzzz";
        lines[9] = tokens.join(" ");
        let text = lines.join("\n");

        let mut reader = reader(&text);
        let header = read_header_v2(&mut reader).unwrap();
        let err = read_waveforms(&mut reader, &header).unwrap_err();
        assert!(matches!(err, ScanError::Decode { line: 10, ref token } if token == "zzzz"), "{err}");
    }

    #[test]
    fn test_short_record_is_shape_error() {
        let mut lines: Vec<String> = v2_text(0, 1, 1, 2).lines().map(str::to_string).collect();
        lines[9] = lines[9].split(' ').take(5).collect::<Vec<_>>().join(" ");
        let text = lines.join("\n");

        let mut reader = reader(&text);
        let header = read_header_v2(&mut reader).unwrap();
        let err = read_waveforms(&mut reader, &header).unwrap_err();
        assert!(matches!(err, ScanError::RecordShape { .. }), "{err}");
    }

    #[test]
    fn test_truncated_file() {
        let text = v2_text(0, 2, 2, 2);
        let cut: String = text.lines().take(20).collect::<Vec<_>>().join("\n");
        let mut lines = reader(&cut);
        let header = read_header_v2(&mut lines).unwrap();
        let err = read_waveforms(&mut lines, &header).unwrap_err();
        assert!(matches!(err, ScanError::UnexpectedEof { .. }), "{err}");
    }

    #[test]
    fn test_file_loading() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(v1_text(0, 2, 2, 3).as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let scan = ScanFile::load(temp_file.path(), &DataFormatV1).unwrap();
        assert_eq!(scan.file_path, temp_file.path());
        assert_eq!(scan.waveforms.shape(), [2, 2, 16, 3]);
        assert_eq!(scan.file_header.geometry.n_samples, 3);
    }

    #[test]
    fn test_errors_name_the_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"BOARDID:1\nEVENT\n").unwrap();
        temp_file.flush().unwrap();

        let err = ScanFile::load(temp_file.path(), &DataFormatV2).unwrap_err();
        assert!(matches!(err, ScanError::InFile { .. }));
        assert!(matches!(err.root(), ScanError::HeaderParse { .. }));
        assert!(err.to_string().contains(&temp_file.path().display().to_string()));
    }
}
