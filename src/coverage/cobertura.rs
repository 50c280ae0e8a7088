//! Cobertura XML artifact parsing.
//!
//! Most coverage tools (coverage.py, tarpaulin, JaCoCo converters) can write
//! Cobertura. Only the parts needed for merging are read:
//!
//! ```xml
//! <coverage>
//!   <packages><package><classes>
//!     <class filename="pkg/mod.py">
//!       <lines>
//!         <line number="3" hits="1"/>
//!         <line number="4" hits="0"/>
//!       </lines>
//!     </class>
//!   </classes></package></packages>
//! </coverage>
//! ```
//!
//! Each `<line>` becomes a single-line [`SourceLocation`]. Lines nested in
//! `<methods>` repeat the class lines and are skipped.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use super::{ArtifactError, ArtifactStatus, CoverageArtifact, SourceLocation};

/// Parses a Cobertura document into an artifact for `shard`.
pub fn parse(content: &str, shard: usize) -> Result<CoverageArtifact, ArtifactError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut artifact = CoverageArtifact::new(shard, ArtifactStatus::Success);
    let mut current_file: Option<String> = None;
    let mut method_depth = 0usize;

    loop {
        match reader.read_event().map_err(|e| cobertura_error(&reader, e))? {
            Event::Start(e) => match e.name().as_ref() {
                b"class" => current_file = Some(attribute(&e, b"filename")?),
                b"method" => method_depth += 1,
                b"line" if method_depth == 0 => record_line(&mut artifact, &current_file, &e)?,
                _ => {}
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"line" if method_depth == 0 => record_line(&mut artifact, &current_file, &e)?,
                _ => {}
            },
            Event::End(e) => match e.name().as_ref() {
                b"class" => current_file = None,
                b"method" => method_depth = method_depth.saturating_sub(1),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(artifact)
}

fn record_line(
    artifact: &mut CoverageArtifact,
    file: &Option<String>,
    element: &BytesStart<'_>,
) -> Result<(), ArtifactError> {
    let Some(file) = file else {
        return Err(ArtifactError::Cobertura(
            "<line> outside of a <class>".to_string(),
        ));
    };

    let number: u32 = parse_number(&attribute(element, b"number")?, "number")?;
    let hits: u64 = parse_number(&attribute(element, b"hits")?, "hits")?;
    artifact.record(SourceLocation::line(file.clone(), number), hits);
    Ok(())
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Result<String, ArtifactError> {
    let attr = element
        .try_get_attribute(name)
        .map_err(|e| ArtifactError::Cobertura(e.to_string()))?
        .ok_or_else(|| {
            ArtifactError::Cobertura(format!(
                "<{}> without {} attribute",
                String::from_utf8_lossy(element.name().as_ref()),
                String::from_utf8_lossy(name)
            ))
        })?;
    let value = attr
        .unescape_value()
        .map_err(|e| ArtifactError::Cobertura(e.to_string()))?;
    Ok(value.into_owned())
}

fn parse_number<T: std::str::FromStr>(value: &str, what: &str) -> Result<T, ArtifactError> {
    value
        .trim()
        .parse()
        .map_err(|_| ArtifactError::Cobertura(format!("invalid {} '{}'", what, value)))
}

fn cobertura_error(reader: &Reader<&[u8]>, e: quick_xml::Error) -> ArtifactError {
    ArtifactError::Cobertura(format!("at byte {}: {}", reader.buffer_position(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" ?>
<coverage version="7.4" line-rate="0.5">
  <sources><source>/work/pkg</source></sources>
  <packages>
    <package name="pkg">
      <classes>
        <class name="a.py" filename="pkg/a.py">
          <methods>
            <method name="f"><lines><line number="1" hits="9"/></lines></method>
          </methods>
          <lines>
            <line number="1" hits="1"/>
            <line number="2" hits="0"/>
          </lines>
        </class>
        <class name="b.py" filename="pkg/b.py">
          <lines><line number="10" hits="3" branch="false"/></lines>
        </class>
      </classes>
    </package>
  </packages>
</coverage>"#;

    #[test]
    fn test_parse_sample() {
        let artifact = parse(SAMPLE, 5).unwrap();
        assert_eq!(artifact.shard, 5);
        assert_eq!(artifact.hits.len(), 3);
        // Method lines are not double counted.
        assert_eq!(artifact.hits[&SourceLocation::line("pkg/a.py", 1)], 1);
        assert_eq!(artifact.hits[&SourceLocation::line("pkg/a.py", 2)], 0);
        assert_eq!(artifact.hits[&SourceLocation::line("pkg/b.py", 10)], 3);
    }

    #[test]
    fn test_parse_rejects_missing_hits() {
        let err = parse(
            r#"<coverage><class filename="a.py"><lines><line number="1"/></lines></class></coverage>"#,
            1,
        )
        .unwrap_err();
        assert!(err.to_string().contains("hits"));
    }

    #[test]
    fn test_parse_rejects_malformed_xml() {
        assert!(parse("<coverage><class filename=\"a\"></coverage>", 1).is_err());
    }
}
