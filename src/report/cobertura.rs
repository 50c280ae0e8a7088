//! Cobertura XML output for merged coverage.
//!
//! Most CI coverage widgets read Cobertura, so the merged result is written
//! in that shape as well:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <coverage line-rate="0.6667" branch-rate="0" lines-covered="2" lines-valid="3" version="shardcov">
//!   <packages>
//!     <package name="pkg" line-rate="0.6667" branch-rate="0">
//!       <classes>
//!         <class name="a.py" filename="pkg/a.py" line-rate="0.6667" branch-rate="0">
//!           <methods/>
//!           <lines>
//!             <line number="1" hits="3"/>
//!           </lines>
//!         </class>
//!       </classes>
//!     </package>
//!   </packages>
//! </coverage>
//! ```
//!
//! Files are grouped into packages by directory. Locations spanning several
//! lines are written as one `<line>` at their start line.

use std::collections::BTreeMap;

use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};

use crate::coverage::{FileCoverage, MergedCoverage};

/// Renders `merged` as a Cobertura XML document.
pub fn to_xml(merged: &MergedCoverage) -> anyhow::Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut coverage = BytesStart::new("coverage");
    coverage.push_attribute(("line-rate", rate(merged.covered(), merged.total()).as_str()));
    coverage.push_attribute(("branch-rate", "0"));
    coverage.push_attribute(("lines-covered", merged.covered().to_string().as_str()));
    coverage.push_attribute(("lines-valid", merged.total().to_string().as_str()));
    coverage.push_attribute(("version", concat!("shardcov ", env!("CARGO_PKG_VERSION"))));
    writer.write_event(Event::Start(coverage))?;
    writer.write_event(Event::Start(BytesStart::new("packages")))?;

    let mut lines = lines_by_file(merged);
    for (package, files) in packages(merged) {
        let covered = files.iter().map(|(_, f)| f.covered).sum();
        let total = files.iter().map(|(_, f)| f.total).sum();

        let mut element = BytesStart::new("package");
        element.push_attribute(("name", package));
        element.push_attribute(("line-rate", rate(covered, total).as_str()));
        element.push_attribute(("branch-rate", "0"));
        writer.write_event(Event::Start(element))?;
        writer.write_event(Event::Start(BytesStart::new("classes")))?;

        for (path, file) in files {
            let file_lines = lines.remove(path).unwrap_or_default();
            write_class(&mut writer, path, file, file_lines)?;
        }

        writer.write_event(Event::End(BytesEnd::new("classes")))?;
        writer.write_event(Event::End(BytesEnd::new("package")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("packages")))?;
    writer.write_event(Event::End(BytesEnd::new("coverage")))?;

    Ok(String::from_utf8(writer.into_inner())?)
}

fn write_class<W: std::io::Write>(
    writer: &mut Writer<W>,
    path: &str,
    file: &FileCoverage,
    lines: BTreeMap<u32, u64>,
) -> anyhow::Result<()> {
    let name = path.rsplit_once('/').map_or(path, |(_, name)| name);

    let mut class = BytesStart::new("class");
    class.push_attribute(("name", name));
    class.push_attribute(("filename", path));
    class.push_attribute(("line-rate", rate(file.covered, file.total).as_str()));
    class.push_attribute(("branch-rate", "0"));
    writer.write_event(Event::Start(class))?;
    writer.write_event(Event::Empty(BytesStart::new("methods")))?;
    writer.write_event(Event::Start(BytesStart::new("lines")))?;

    for (number, hits) in lines {
        let mut line = BytesStart::new("line");
        line.push_attribute(("number", number.to_string().as_str()));
        line.push_attribute(("hits", hits.to_string().as_str()));
        writer.write_event(Event::Empty(line))?;
    }

    writer.write_event(Event::End(BytesEnd::new("lines")))?;
    writer.write_event(Event::End(BytesEnd::new("class")))?;
    Ok(())
}

/// Hits per start line, per file. Several locations may start on the same line.
fn lines_by_file(merged: &MergedCoverage) -> BTreeMap<&str, BTreeMap<u32, u64>> {
    let mut files: BTreeMap<&str, BTreeMap<u32, u64>> = BTreeMap::new();
    for (location, hits) in &merged.hits {
        let entry = files
            .entry(location.file.as_str())
            .or_default()
            .entry(location.start_line)
            .or_insert(0);
        *entry = entry.saturating_add(*hits);
    }
    files
}

/// Files grouped by their directory, `.` for top-level files.
fn packages(merged: &MergedCoverage) -> BTreeMap<&str, Vec<(&str, &FileCoverage)>> {
    let mut packages: BTreeMap<&str, Vec<(&str, &FileCoverage)>> = BTreeMap::new();
    for (path, file) in &merged.files {
        let package = path.rsplit_once('/').map_or(".", |(dir, _)| dir);
        packages.entry(package).or_default().push((path.as_str(), file));
    }
    packages
}

fn rate(covered: usize, total: usize) -> String {
    if total == 0 {
        "0".to_string()
    } else {
        format!("{:.4}", covered as f64 / total as f64)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::coverage::{ArtifactStatus, CoverageArtifact, Merger, SourceLocation, cobertura};

    fn merged() -> MergedCoverage {
        let artifact = CoverageArtifact::new(1, ArtifactStatus::Success)
            .with_hits(SourceLocation::line("pkg/a.py", 1), 3)
            .with_hits(SourceLocation::line("pkg/a.py", 2), 0)
            .with_hits(SourceLocation::range("pkg/a.py", 4, 6), 1)
            .with_hits(SourceLocation::line("setup.py", 1), 1);
        Merger::new(1).merge(&[(1, artifact)].into(), &BTreeMap::new())
    }

    #[test]
    fn test_document_structure() {
        let xml = to_xml(&merged()).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains(r#"lines-covered="3""#));
        assert!(xml.contains(r#"lines-valid="4""#));
        assert!(xml.contains(r#"<package name="pkg" line-rate="0.6667""#));
        assert!(xml.contains(r#"<package name=".""#));
        assert!(xml.contains(r#"<class name="a.py" filename="pkg/a.py""#));
        assert!(xml.contains(r#"<line number="4" hits="1"/>"#));
    }

    #[test]
    fn test_output_reads_back() {
        let merged = merged();
        let xml = to_xml(&merged).unwrap();
        let artifact = cobertura::parse(&xml, 1).unwrap();

        let reread = Merger::new(1).merge(&[(1, artifact)].into(), &BTreeMap::new());
        assert_eq!(reread.covered(), merged.covered());
        assert_eq!(reread.total(), merged.total());
    }

    #[test]
    fn test_lines_stay_with_their_file() {
        let artifact = CoverageArtifact::new(1, ArtifactStatus::Success)
            .with_hits(SourceLocation::line("a.py", 1), 3)
            .with_hits(SourceLocation::range("a.py", 1, 2), 2)
            .with_hits(SourceLocation::line("b.py", 1), 7);
        let merged = Merger::new(1).merge(&[(1, artifact)].into(), &BTreeMap::new());
        let xml = to_xml(&merged).unwrap();

        let (a, b) = xml.split_once(r#"filename="b.py""#).unwrap();
        assert!(a.contains(r#"<line number="1" hits="5"/>"#));
        assert!(!a.contains(r#"hits="7""#));
        assert!(b.contains(r#"<line number="1" hits="7"/>"#));
        assert!(!b.contains(r#"hits="5""#));
    }

    #[test]
    fn test_empty_coverage() {
        let merged = Merger::new(1).merge(&BTreeMap::new(), &BTreeMap::new());
        let xml = to_xml(&merged).unwrap();
        assert!(xml.contains(r#"line-rate="0""#));
        assert!(xml.contains("<packages>"));
    }
}
