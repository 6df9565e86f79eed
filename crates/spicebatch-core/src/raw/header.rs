//! Raw file header: tagged text lines up to the `Binary:` / `Values:` marker

use crate::types::{
    DataSection, Encoding, PlotKind, Result, SpiceError, StorageLayout, TraceKind, BINARY_MARKER,
    FLAG_COMPLEX, FLAG_DOUBLE, FLAG_FAST_ACCESS, FLAG_LOG, FLAG_STEPPED, HEADER_TAGS,
    VALUES_MARKER,
};
use indexmap::IndexMap;
use tracing::debug;

/// Space separated set from the `Flags:` line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flags {
    tokens: Vec<String>,
}

impl Flags {
    pub fn parse(line: &str) -> Self {
        Self {
            tokens: line.split_whitespace().map(str::to_string).collect(),
        }
    }

    /// Case-insensitive membership test
    pub fn contains(&self, flag: &str) -> bool {
        self.tokens.iter().any(|t| t.eq_ignore_ascii_case(flag))
    }

    pub fn insert(&mut self, flag: &str) {
        if !self.contains(flag) {
            self.tokens.push(flag.to_string());
        }
    }

    pub fn is_complex(&self) -> bool {
        self.contains(FLAG_COMPLEX)
    }

    pub fn is_stepped(&self) -> bool {
        self.contains(FLAG_STEPPED)
    }

    pub fn is_double(&self) -> bool {
        self.contains(FLAG_DOUBLE)
    }

    pub fn is_log(&self) -> bool {
        self.contains(FLAG_LOG)
    }

    pub fn layout(&self) -> StorageLayout {
        if self.contains(FLAG_FAST_ACCESS) {
            StorageLayout::Columnar
        } else {
            StorageLayout::Interleaved
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }
}

impl std::fmt::Display for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.tokens.join(" "))
    }
}

/// One line of the `Variables:` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceDescriptor {
    pub ordinal: usize,
    pub name: String,
    pub kind: TraceKind,
}

/// Decoded header section
#[derive(Debug, Clone)]
pub struct RawHeader {
    /// Tagged properties in file order (everything except the variable table)
    pub properties: IndexMap<String, String>,
    pub backannotations: Vec<String>,
    pub flags: Flags,
    pub plot: PlotKind,
    pub num_points: usize,
    pub num_variables: usize,
    pub variables: Vec<TraceDescriptor>,
    pub encoding: Encoding,
    pub section: DataSection,
    /// Byte offset of the first body byte
    pub data_offset: usize,
}

impl RawHeader {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn title(&self) -> &str {
        self.property("Title").unwrap_or_default()
    }

    pub fn has_axis(&self) -> bool {
        self.plot.has_axis()
    }

    /// Values are complex when flagged, and always for AC plots
    pub fn is_complex(&self) -> bool {
        self.flags.is_complex() || self.plot == PlotKind::Ac
    }

    /// Header text up to and including the section marker line
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.properties {
            out.push_str(&format!("{}: {}\n", key, value));
        }
        for note in &self.backannotations {
            out.push_str(&format!("Backannotation: {}\n", note));
        }
        out.push_str("Variables:\n");
        for var in &self.variables {
            out.push_str(&format!("\t{}\t{}\t{}\n", var.ordinal, var.name, var.kind));
        }
        out.push_str(match self.section {
            DataSection::Binary => BINARY_MARKER,
            DataSection::Values => VALUES_MARKER,
        });
        out.push('\n');
        out
    }
}

fn detect_encoding(bytes: &[u8]) -> Result<Encoding> {
    if bytes.starts_with(b"Title:") {
        Ok(Encoding::Utf8)
    } else if bytes.starts_with(b"T\0i\0t\0") {
        Ok(Encoding::Utf16Le)
    } else {
        Err(WaveformHeaderError::Encoding.into())
    }
}

/// Read the line starting at `pos`, returning it without terminator and the next position
fn next_line(bytes: &[u8], pos: usize, encoding: Encoding) -> Option<(String, usize)> {
    if pos >= bytes.len() {
        return None;
    }
    match encoding {
        Encoding::Utf8 => {
            let rest = &bytes[pos..];
            let end = rest.iter().position(|&b| b == b'\n')?;
            let line = String::from_utf8_lossy(&rest[..end]);
            Some((line.trim_end_matches('\r').to_string(), pos + end + 1))
        }
        Encoding::Utf16Le => {
            let mut units = Vec::new();
            let mut p = pos;
            while p + 1 < bytes.len() {
                let unit = u16::from_le_bytes([bytes[p], bytes[p + 1]]);
                p += 2;
                if unit == u16::from(b'\n') {
                    let line = String::from_utf16_lossy(&units);
                    return Some((line.trim_end_matches('\r').to_string(), p));
                }
                units.push(unit);
            }
            None
        }
    }
}

enum WaveformHeaderError {
    Encoding,
    NoDataSection,
    MissingTag(&'static str),
}

impl From<WaveformHeaderError> for SpiceError {
    fn from(e: WaveformHeaderError) -> Self {
        let msg = match e {
            WaveformHeaderError::Encoding => "Unrecognized header encoding".to_string(),
            WaveformHeaderError::NoDataSection => "No data section found in raw file".to_string(),
            WaveformHeaderError::MissingTag(tag) => {
                format!("Missing required header tag '{}'", tag)
            }
        };
        SpiceError::Parse(msg)
    }
}

fn parse_count(properties: &IndexMap<String, String>, tag: &'static str) -> Result<usize> {
    let value = properties
        .get(tag)
        .ok_or(WaveformHeaderError::MissingTag(tag))?;
    value
        .trim()
        .parse()
        .map_err(|_| SpiceError::Parse(format!("Invalid '{}' value '{}'", tag, value)))
}

fn parse_descriptor(line: &str) -> Result<TraceDescriptor> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(SpiceError::Parse(format!(
            "Malformed variable line '{}'",
            line.trim()
        )));
    }
    let ordinal = parts[0]
        .parse()
        .map_err(|_| SpiceError::Parse(format!("Invalid variable ordinal '{}'", parts[0])))?;
    Ok(TraceDescriptor {
        ordinal,
        name: parts[1].to_string(),
        kind: TraceKind::parse(parts[2]),
    })
}

/// Parse the header of a raw file image
pub fn parse_header(bytes: &[u8]) -> Result<RawHeader> {
    let encoding = detect_encoding(bytes)?;

    let mut properties = IndexMap::new();
    let mut backannotations = Vec::new();
    let mut variables = Vec::new();
    let mut in_variables = false;
    let mut seen_variables = false;
    let mut pos = 0;

    let (section, data_offset) = loop {
        let (line, next) =
            next_line(bytes, pos, encoding).ok_or(WaveformHeaderError::NoDataSection)?;
        pos = next;

        let trimmed = line.trim();
        if trimmed == BINARY_MARKER {
            break (DataSection::Binary, pos);
        }
        if trimmed == VALUES_MARKER {
            break (DataSection::Values, pos);
        }

        if in_variables {
            if !trimmed.is_empty() {
                variables.push(parse_descriptor(trimmed)?);
            }
            continue;
        }

        let (key, value) = line.split_once(':').unwrap_or((line.as_str(), ""));
        let key = key.trim();
        match key {
            "Variables" => {
                in_variables = true;
                seen_variables = true;
            }
            "Backannotation" => backannotations.push(value.trim().to_string()),
            "" => {}
            _ => {
                if !HEADER_TAGS.contains(&key) {
                    debug!(tag = key, "Unknown header tag");
                }
                properties.insert(key.to_string(), value.trim().to_string());
            }
        }
    };

    if !seen_variables {
        return Err(WaveformHeaderError::MissingTag("Variables").into());
    }
    let plot = PlotKind::parse(
        properties
            .get("Plotname")
            .ok_or(WaveformHeaderError::MissingTag("Plotname"))?,
    );
    let flags = Flags::parse(
        properties
            .get("Flags")
            .ok_or(WaveformHeaderError::MissingTag("Flags"))?,
    );
    let num_variables = parse_count(&properties, "No. Variables")?;
    let num_points = parse_count(&properties, "No. Points")?;

    if variables.len() != num_variables {
        return Err(SpiceError::Parse(format!(
            "Header declares {} variables but lists {}",
            num_variables,
            variables.len()
        )));
    }

    debug!(
        ?encoding,
        ?section,
        plot = %plot,
        variables = num_variables,
        points = num_points,
        flags = %flags,
        "Header parsed"
    );

    Ok(RawHeader {
        properties,
        backannotations,
        flags,
        plot,
        num_points,
        num_variables,
        variables,
        encoding,
        section,
        data_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "Title: * test.net\nDate: Mon Jan 01 00:00:00 2024\nPlotname: Transient Analysis\nFlags: real forward stepped\nNo. Variables: 2\nNo. Points: 3\nOffset: 0.0\nCommand: LTspice\nVariables:\n\t0\ttime\ttime\n\t1\tV(out)\tvoltage\nBinary:\n";

    #[test]
    fn test_parse_utf8_header() {
        let header = parse_header(HEADER.as_bytes()).unwrap();
        assert_eq!(header.encoding, Encoding::Utf8);
        assert_eq!(header.section, DataSection::Binary);
        assert_eq!(header.plot, PlotKind::Transient);
        assert_eq!(header.num_variables, 2);
        assert_eq!(header.num_points, 3);
        assert_eq!(header.variables[1].name, "V(out)");
        assert_eq!(header.variables[1].kind, TraceKind::Voltage);
        assert!(header.flags.is_stepped());
        assert_eq!(header.data_offset, HEADER.len());
        assert_eq!(header.title(), "* test.net");
    }

    #[test]
    fn test_parse_utf16_header() {
        let bytes = Encoding::Utf16Le.encode(HEADER);
        let header = parse_header(&bytes).unwrap();
        assert_eq!(header.encoding, Encoding::Utf16Le);
        assert_eq!(header.data_offset, bytes.len());
        assert_eq!(header.variables.len(), 2);
    }

    #[test]
    fn test_missing_points_tag() {
        let text = HEADER.replace("No. Points: 3\n", "");
        let err = parse_header(text.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("No. Points"));
    }

    #[test]
    fn test_variable_count_mismatch() {
        let text = HEADER.replace("No. Variables: 2", "No. Variables: 3");
        assert!(parse_header(text.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_encoding() {
        assert!(parse_header(b"garbage").is_err());
    }

    #[test]
    fn test_render_round_trip() {
        let header = parse_header(HEADER.as_bytes()).unwrap();
        assert_eq!(header.render(), HEADER);
    }

    #[test]
    fn test_flags_case_insensitive() {
        let flags = Flags::parse("real fastaccess");
        assert_eq!(flags.layout(), StorageLayout::Columnar);
        assert!(!flags.is_complex());
    }
}
