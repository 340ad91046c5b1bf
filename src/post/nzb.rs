//! NZB manifest output
//!
//! Writes the XML index of a finished posting: one `<file>` per input
//! file, one `<segment>` per posted piece. Message-ids are stored without
//! their angle brackets, matching what every downloader expects.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::path::{Path, PathBuf};

use crate::error::{PostError, Result, UlNzbError};

fn xml_error<E: std::fmt::Display>(e: E) -> UlNzbError {
    PostError::NzbRender(e.to_string()).into()
}

const NZB_XMLNS: &str = "http://www.newzbin.com/DTD/2003/nzb";
const NZB_DOCTYPE: &str =
    r#"nzb PUBLIC "-//newzBin//DTD NZB 1.1//EN" "http://www.newzbin.com/DTD/nzb/nzb-1.1.dtd""#;

#[derive(Debug, Clone)]
pub struct NzbSegment {
    /// Post-encoding payload size of the article.
    pub bytes: u64,
    /// 1-based piece number.
    pub number: u32,
    /// Message-id without angle brackets.
    pub message_id: String,
}

#[derive(Debug, Clone)]
pub struct NzbFile {
    pub poster: String,
    pub date: u64,
    pub subject: String,
    pub groups: Vec<String>,
    pub segments: Vec<NzbSegment>,
}

/// Serialize the manifest as UTF-8 XML.
pub fn render(files: &[NzbFile]) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::DocType(BytesText::from_escaped(NZB_DOCTYPE)))
        .map_err(xml_error)?;

    let mut nzb = BytesStart::new("nzb");
    nzb.push_attribute(("xmlns", NZB_XMLNS));
    writer.write_event(Event::Start(nzb)).map_err(xml_error)?;

    for file in files {
        let mut el = BytesStart::new("file");
        el.push_attribute(("poster", file.poster.as_str()));
        el.push_attribute(("date", file.date.to_string().as_str()));
        el.push_attribute(("subject", file.subject.as_str()));
        writer.write_event(Event::Start(el)).map_err(xml_error)?;

        writer
            .write_event(Event::Start(BytesStart::new("groups")))
            .map_err(xml_error)?;
        for group in &file.groups {
            writer
                .write_event(Event::Start(BytesStart::new("group")))
                .map_err(xml_error)?;
            writer
                .write_event(Event::Text(BytesText::new(group)))
                .map_err(xml_error)?;
            writer
                .write_event(Event::End(BytesEnd::new("group")))
                .map_err(xml_error)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("groups")))
            .map_err(xml_error)?;

        writer
            .write_event(Event::Start(BytesStart::new("segments")))
            .map_err(xml_error)?;
        for segment in &file.segments {
            let mut el = BytesStart::new("segment");
            el.push_attribute(("bytes", segment.bytes.to_string().as_str()));
            el.push_attribute(("number", segment.number.to_string().as_str()));
            writer.write_event(Event::Start(el)).map_err(xml_error)?;
            writer
                .write_event(Event::Text(BytesText::new(&segment.message_id)))
                .map_err(xml_error)?;
            writer
                .write_event(Event::End(BytesEnd::new("segment")))
                .map_err(xml_error)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("segments")))
            .map_err(xml_error)?;

        writer
            .write_event(Event::End(BytesEnd::new("file")))
            .map_err(xml_error)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("nzb")))
        .map_err(xml_error)?;

    let mut xml = writer.into_inner();
    xml.push(b'\n');
    Ok(xml)
}

/// Write the manifest to `path`.
pub fn write<P: AsRef<Path>>(path: P, files: &[NzbFile]) -> Result<()> {
    let xml = render(files)?;
    std::fs::write(path, xml)?;
    Ok(())
}

/// Resolve the `--output` argument: a directory gets `<subject>.nzb`
/// placed inside it, anything else is used verbatim.
pub fn resolve_output_path(output: &Path, subject: &str) -> PathBuf {
    if output.is_dir() {
        output.join(format!("{}.nzb", sanitize_file_name(subject)))
    } else {
        output.to_path_buf()
    }
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}
