//! Persistence of the calibrated transform.
//!
//! The file format follows the output extension: `.json` writes the record
//! with serde, anything else writes an OpenCV FileStorage XML document that
//! the stitcher on the rig reads directly.

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::EngineError;
use crate::config::MatchMode;

const STORAGE_TAG: &str = "opencv_storage";
const MATRIX_TAG: &str = "homography";

/// Everything written for one saved transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRecord {
    /// Full-resolution frame size the transform applies to.
    pub image_size: [u32; 2],
    /// Row-major homography mapping the second camera onto the first.
    pub homography: [[f64; 3]; 3],
    pub match_mode: MatchMode,
    /// Correspondences supporting the estimate.
    pub inliers: usize,
    /// Reprojection RMS over the inliers, in pixels.
    pub rms: f64,
    pub calibrated_at: DateTime<Utc>,
}

/// On-disk layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformFormat {
    OpenCvXml,
    Json,
}

impl TransformFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => TransformFormat::Json,
            _ => TransformFormat::OpenCvXml,
        }
    }
}

fn xml_error(e: impl Display) -> EngineError {
    EngineError::Xml(e.to_string())
}

/// Render the record as an OpenCV FileStorage document.
pub fn to_opencv_xml(record: &TransformRecord) -> Result<String, EngineError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", None, None)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Start(BytesStart::new(STORAGE_TAG)))
        .map_err(xml_error)?;

    let size = format!("{} {}", record.image_size[0], record.image_size[1]);
    writer
        .create_element("image_size")
        .write_text_content(BytesText::new(&size))
        .map_err(xml_error)?;
    let selector = record.match_mode.selector().to_string();
    writer
        .create_element("match_mode")
        .write_text_content(BytesText::new(&selector))
        .map_err(xml_error)?;

    writer
        .write_event(Event::Start(
            BytesStart::new(MATRIX_TAG).with_attributes([("type_id", "opencv-matrix")]),
        ))
        .map_err(xml_error)?;
    for (tag, value) in [("rows", "3"), ("cols", "3"), ("dt", "d")] {
        writer
            .create_element(tag)
            .write_text_content(BytesText::new(value))
            .map_err(xml_error)?;
    }
    let data = record
        .homography
        .iter()
        .flatten()
        .map(|v| format!("{:e}", v))
        .collect::<Vec<_>>()
        .join(" ");
    writer
        .create_element("data")
        .write_text_content(BytesText::new(&data))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new(MATRIX_TAG)))
        .map_err(xml_error)?;

    let inliers = record.inliers.to_string();
    writer
        .create_element("inliers")
        .write_text_content(BytesText::new(&inliers))
        .map_err(xml_error)?;
    let rms = format!("{:e}", record.rms);
    writer
        .create_element("rms")
        .write_text_content(BytesText::new(&rms))
        .map_err(xml_error)?;
    // FileStorage strings are double-quoted; the timestamp needs no escaping.
    let stamp = format!(
        "\"{}\"",
        record.calibrated_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    writer
        .create_element("calibrated_at")
        .write_text_content(BytesText::from_escaped(stamp))
        .map_err(xml_error)?;

    writer
        .write_event(Event::End(BytesEnd::new(STORAGE_TAG)))
        .map_err(xml_error)?;

    let mut xml = String::from_utf8(writer.into_inner()).map_err(xml_error)?;
    xml.push('\n');
    Ok(xml)
}

fn parse_values<T: FromStr>(tag: &str, text: &str, count: usize) -> Result<Vec<T>, EngineError> {
    let values = text
        .split_whitespace()
        .map(|v| v.parse::<T>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| EngineError::Xml(format!("invalid <{}> value '{}'", tag, text)))?;
    if values.len() != count {
        return Err(EngineError::Xml(format!(
            "<{}> holds {} values, expected {}",
            tag,
            values.len(),
            count
        )));
    }
    Ok(values)
}

/// Read a record back from an OpenCV FileStorage document.
pub fn from_opencv_xml(xml: &str) -> Result<TransformRecord, EngineError> {
    let mut reader = Reader::from_str(xml);
    let mut open: Vec<String> = Vec::new();

    let mut image_size = None;
    let mut match_mode = None;
    let mut homography = None;
    let mut inliers = None;
    let mut rms = None;
    let mut calibrated_at = None;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => open.push(String::from_utf8_lossy(e.name().as_ref()).into_owned()),
            Event::End(_) => {
                open.pop();
            }
            Event::Text(e) => {
                let text = e.unescape().map_err(xml_error)?;
                let text = text.trim();
                match open.last().map(String::as_str) {
                    Some("image_size") => {
                        let v = parse_values::<u32>("image_size", text, 2)?;
                        image_size = Some([v[0], v[1]]);
                    }
                    Some("match_mode") => {
                        match_mode = Some(MatchMode::from_str(text).map_err(xml_error)?);
                    }
                    Some("data") if open.iter().any(|t| t == MATRIX_TAG) => {
                        let v = parse_values::<f64>("data", text, 9)?;
                        homography = Some([
                            [v[0], v[1], v[2]],
                            [v[3], v[4], v[5]],
                            [v[6], v[7], v[8]],
                        ]);
                    }
                    Some("inliers") => {
                        inliers = Some(parse_values::<usize>("inliers", text, 1)?[0]);
                    }
                    Some("rms") => rms = Some(parse_values::<f64>("rms", text, 1)?[0]),
                    Some("calibrated_at") => {
                        let stamp = DateTime::parse_from_rfc3339(text.trim_matches('"'))
                            .map_err(xml_error)?;
                        calibrated_at = Some(stamp.with_timezone(&Utc));
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let missing = |tag: &str| EngineError::Xml(format!("missing <{}>", tag));
    Ok(TransformRecord {
        image_size: image_size.ok_or_else(|| missing("image_size"))?,
        homography: homography.ok_or_else(|| missing(MATRIX_TAG))?,
        match_mode: match_mode.ok_or_else(|| missing("match_mode"))?,
        inliers: inliers.ok_or_else(|| missing("inliers"))?,
        rms: rms.ok_or_else(|| missing("rms"))?,
        calibrated_at: calibrated_at.ok_or_else(|| missing("calibrated_at"))?,
    })
}

/// Write the record to `path`, replacing any previous file atomically.
pub fn write_transform(path: &Path, record: &TransformRecord) -> Result<PathBuf, EngineError> {
    let persist_error = |source: std::io::Error| EngineError::Persist {
        path: path.to_path_buf(),
        source,
    };

    let content = match TransformFormat::from_path(path) {
        TransformFormat::Json => serde_json::to_string_pretty(record)?,
        TransformFormat::OpenCvXml => to_opencv_xml(record)?,
    };

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(persist_error)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "transform".to_string());
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    fs::write(&tmp, content).map_err(persist_error)?;
    fs::rename(&tmp, path).map_err(persist_error)?;

    Ok(path.to_path_buf())
}
