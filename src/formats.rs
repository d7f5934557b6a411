// Formats Module
// Dialect registry and the parse entry point

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Local;
use tracing::{debug, info, instrument};

use crate::calibration::{fit_all, Calibration, Matrix};
use crate::config::AnalysisConfig;
use crate::pulse::{fit_peaks, PeakTable};
use crate::scan_tools::{
    read_header_v1, read_header_v2, LineReader, RawWaveforms, Result, ScanError, ScanFile, ScanGeometry, ScanHeader,
};
use crate::signal::ReducedSignal;

/// Column types a structure definition may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    Text,
    Numeric,
    Integer,
    Real,
    Blob,
}

impl FromStr for Datatype {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "TEXT" => Ok(Datatype::Text),
            "NUMERIC" => Ok(Datatype::Numeric),
            "INTEGER" => Ok(Datatype::Integer),
            "REAL" => Ok(Datatype::Real),
            "BLOB" => Ok(Datatype::Blob),
            _ => Err(()),
        }
    }
}

/// One header dialect.
///
/// A dialect knows how to read its header and which fields it contributes to
/// the entry record. The record body is the same for every dialect.
pub trait DataFormat: Send + Sync {
    fn version(&self) -> &'static str;

    /// `(field, datatype)` of every entry field, in order.
    fn structure(&self) -> &'static [(&'static str, &'static str)];

    fn read_header(&self, reader: &mut LineReader<'_>) -> Result<ScanHeader>;

    /// Header fields placed between the path and the calibration.
    fn metadata_fields(&self, geometry: &ScanGeometry) -> Vec<EntryField>;

    /// Fields appended after the timestamp.
    fn trailing_fields(&self, _geometry: &ScanGeometry) -> Vec<EntryField> {
        Vec::new()
    }
}

pub struct DataFormatV1;

pub struct DataFormatV2;

const V1_STRUCTURE: &[(&str, &str)] = &[
    ("path", "TEXT"),
    ("label", "TEXT"),
    ("offset", "INTEGER"),
    ("nstep", "INTEGER"),
    ("nstep_event", "INTEGER"),
    ("nstep_data", "INTEGER"),
    ("nsample", "INTEGER"),
    ("calibration", "TEXT"),
    ("added", "TEXT"),
];

const V2_STRUCTURE: &[(&str, &str)] = &[
    ("path", "TEXT"),
    ("BOARDID", "TEXT"),
    ("CHANNELMIN", "INTEGER"),
    ("NUMBEROFSTEPS", "INTEGER"),
    ("EVENTSPERSTEP", "INTEGER"),
    ("DACPERSTEP", "INTEGER"),
    ("NSAMPLES", "INTEGER"),
    ("calibration", "TEXT"),
    ("added", "TEXT"),
    ("TESTERID", "TEXT"),
];

/// Header value `key` as declared by the structure: integers when the
/// declared type is INTEGER and the value parses, text otherwise.
fn header_field(geometry: &ScanGeometry, key: &str, structure: &[(&str, &str)]) -> EntryField {
    let value = geometry
        .version_fields
        .get(key)
        .cloned()
        .unwrap_or_else(|| "NA".to_string());
    let integer = structure
        .iter()
        .any(|(name, datatype)| *name == key && *datatype == "INTEGER");
    match value.parse::<i64>() {
        Ok(v) if integer => EntryField::Integer(v),
        _ => EntryField::Text(value),
    }
}

impl DataFormat for DataFormatV1 {
    fn version(&self) -> &'static str {
        "v1"
    }

    fn structure(&self) -> &'static [(&'static str, &'static str)] {
        V1_STRUCTURE
    }

    fn read_header(&self, reader: &mut LineReader<'_>) -> Result<ScanHeader> {
        read_header_v1(reader)
    }

    fn metadata_fields(&self, geometry: &ScanGeometry) -> Vec<EntryField> {
        ["label", "offset", "nstep", "nstep_event", "nstep_data", "nsample"]
            .iter()
            .map(|key| header_field(geometry, key, V1_STRUCTURE))
            .collect()
    }
}

impl DataFormat for DataFormatV2 {
    fn version(&self) -> &'static str {
        "v2"
    }

    fn structure(&self) -> &'static [(&'static str, &'static str)] {
        V2_STRUCTURE
    }

    fn read_header(&self, reader: &mut LineReader<'_>) -> Result<ScanHeader> {
        read_header_v2(reader)
    }

    fn metadata_fields(&self, geometry: &ScanGeometry) -> Vec<EntryField> {
        ["BOARDID", "CHANNELMIN", "NUMBEROFSTEPS", "EVENTSPERSTEP", "DACPERSTEP", "NSAMPLES"]
            .iter()
            .map(|key| header_field(geometry, key, V2_STRUCTURE))
            .collect()
    }

    fn trailing_fields(&self, geometry: &ScanGeometry) -> Vec<EntryField> {
        vec![header_field(geometry, "TESTERID", V2_STRUCTURE)]
    }
}

/// Check that every datatype in a structure definition is known.
pub fn verify_structure(format: &dyn DataFormat) -> Result<()> {
    for (field, datatype) in format.structure() {
        if datatype.parse::<Datatype>().is_err() {
            return Err(ScanError::Format {
                version: format.version().to_string(),
                field: field.to_string(),
                datatype: datatype.to_string(),
            });
        }
    }
    Ok(())
}

/// Maps a format key (`v1`, `v2`, `auto`) to its dialect.
///
/// Built once by the caller and passed where needed.
#[derive(Default, Clone)]
pub struct FormatRegistry {
    formats: HashMap<String, Arc<dyn DataFormat>>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Both dialects, with `auto` resolving to the newest.
    pub fn standard() -> Result<Self> {
        let v2: Arc<dyn DataFormat> = Arc::new(DataFormatV2);
        let mut registry = Self::new();
        registry.register("v1", Arc::new(DataFormatV1))?;
        registry.register("v2", Arc::clone(&v2))?;
        registry.register("auto", v2)?;
        Ok(registry)
    }

    /// Add a dialect under `key`, rejecting an invalid structure definition.
    pub fn register(&mut self, key: &str, format: Arc<dyn DataFormat>) -> Result<()> {
        verify_structure(format.as_ref())?;
        self.formats.insert(key.to_string(), format);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<&dyn DataFormat> {
        self.formats
            .get(key)
            .map(|f| f.as_ref())
            .ok_or_else(|| ScanError::UnknownFormat(key.to_string()))
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.formats.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// [`parse`] with the dialect registered under `key`.
    pub fn parse<P: AsRef<Path>>(
        &self,
        key: &str,
        input_file: P,
        mode: OutputMode,
        config: &AnalysisConfig,
    ) -> Result<ParseOutput> {
        parse(self.get(key)?, input_file.as_ref(), mode, config)
    }

    pub fn read_header<P: AsRef<Path>>(&self, key: &str, input_file: P) -> Result<ScanHeader> {
        ScanFile::read_header(input_file, self.get(key)?)
    }
}

impl fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatRegistry").field("keys", &self.keys()).finish()
    }
}

/// What [`parse`] should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Entry,
    /// Decoded waveforms, before any reduction.
    Raw,
    /// Reduced signal, peaks and calibration.
    Signal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryField {
    Text(String),
    Integer(i64),
}

impl fmt::Display for EntryField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryField::Text(s) => write!(f, "{}", s),
            EntryField::Integer(v) => write!(f, "{}", v),
        }
    }
}

/// Flat record of one calibrated scan, for the run log.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub fields: Vec<(String, EntryField)>,
}

impl Entry {
    pub fn get(&self, name: &str) -> Option<&EntryField> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn values(&self) -> impl Iterator<Item = &EntryField> {
        self.fields.iter().map(|(_, v)| v)
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.fields {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

/// Everything the plotting side needs from one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalBundle {
    /// Per-sample mean and sigma over trials.
    pub signal: ReducedSignal,
    pub peaks: PeakTable,
    pub calibration: Calibration,
}

impl SignalBundle {
    pub fn pars(&self) -> Vec<[f64; 2]> {
        self.calibration.pars()
    }

    pub fn errs(&self) -> Vec<[f64; 2]> {
        self.calibration.errs()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutput {
    Entry(Entry),
    Raw(RawWaveforms),
    Signal(SignalBundle),
}

fn analyse(raw: &RawWaveforms, config: &AnalysisConfig) -> Result<SignalBundle> {
    let signal = ReducedSignal::from_raw(raw);
    let peaks = fit_peaks(&signal, &config.pulse)?;
    let calibration = fit_all(&peaks, &config.calibration)?;
    Ok(SignalBundle {
        signal,
        peaks,
        calibration,
    })
}

fn build_entry(format: &dyn DataFormat, path: &Path, header: &ScanHeader, calibration: &Calibration) -> Result<Entry> {
    let geometry = &header.geometry;
    let mut values = vec![EntryField::Text(path.display().to_string())];
    values.extend(format.metadata_fields(geometry));
    values.push(EntryField::Text(format!(
        "{}{}",
        Matrix(&calibration.pars()),
        Matrix(&calibration.errs())
    )));
    values.push(EntryField::Text(format!(
        "ENTRY ADDED: {}",
        Local::now().format("%y%m%d-%H:%M:%S")
    )));
    values.extend(format.trailing_fields(geometry));

    let structure = format.structure();
    if structure.len() != values.len() {
        return Err(ScanError::Format {
            version: format.version().to_string(),
            field: format!("{} fields declared", structure.len()),
            datatype: format!("{} fields produced", values.len()),
        });
    }
    let fields = structure
        .iter()
        .map(|(name, _)| name.to_string())
        .zip(values)
        .collect();
    Ok(Entry { fields })
}

/// Parse one scan file.
///
/// Header, record and decode errors abort the parse, as does a failed
/// calibration fit. Every error names the file.
#[instrument(skip_all, fields(version = format.version(), path = %input_file.display()))]
pub fn parse(format: &dyn DataFormat, input_file: &Path, mode: OutputMode, config: &AnalysisConfig) -> Result<ParseOutput> {
    let scan = ScanFile::load(input_file, format)?;
    debug!(shape = ?scan.waveforms.shape(), "waveforms decoded");

    if mode == OutputMode::Raw {
        return Ok(ParseOutput::Raw(scan.waveforms));
    }

    let bundle = analyse(&scan.waveforms, config).map_err(|e| e.in_file(&scan.file_path))?;
    info!(steps = bundle.peaks.n_steps, "scan calibrated");

    match mode {
        OutputMode::Signal => Ok(ParseOutput::Signal(bundle)),
        _ => {
            let entry = build_entry(format, &scan.file_path, &scan.file_header, &bundle.calibration)
                .map_err(|e| e.in_file(&scan.file_path))?;
            Ok(ParseOutput::Entry(entry))
        }
    }
}
