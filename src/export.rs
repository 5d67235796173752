use anyhow::Context;
use std::io::Write;
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::report::{GradeSummaryModel, ResultSheetModel};

#[derive(Debug, Clone)]
pub struct FileExportSummary {
    pub row_count: usize,
}

/// Flattens a result sheet model into the fixed institutional grid: the
/// letterhead block, one header row, one row per student across all pages.
pub fn result_sheet_grid(model: &ResultSheetModel) -> Vec<Vec<String>> {
    let mut grid: Vec<Vec<String>> = Vec::new();
    for line in &model.letterhead.lines {
        grid.push(vec![line.clone()]);
    }
    grid.push(vec![model.letterhead.title.clone()]);
    grid.push(vec![model.letterhead.subtitle.clone()]);
    grid.push(vec![String::new()]);

    let mut header: Vec<String> = vec!["Reg No".into(), "Full Name".into()];
    for c in model
        .regular_courses
        .iter()
        .chain(model.carry_over_courses.iter())
    {
        header.push(c.key.clone());
    }
    header.extend(
        [
            "TCC", "TCE", "TPE", "GPA", "Prev CCC", "Prev CCE", "Prev CPE", "Prev CGPA", "CCC",
            "CCE", "CPE", "CGPA", "Remark",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    grid.push(header);

    for page in &model.pages {
        for row in &page.rows {
            let mut out: Vec<String> = vec![row.reg_no.clone(), row.full_name.clone()];
            out.extend(row.regular_cells.iter().cloned());
            out.extend(row.carry_over_cells.iter().cloned());
            out.push(row.current.tcc.to_string());
            out.push(row.current.tce.to_string());
            out.push(format!("{:.1}", row.current.tpe));
            out.push(format!("{:.2}", row.current.gpa));
            match &row.previous {
                Some(prev) => {
                    out.push(prev.ccc.to_string());
                    out.push(prev.cce.to_string());
                    out.push(format!("{:.1}", prev.cpe));
                    out.push(format!("{:.2}", prev.cgpa));
                }
                None => out.extend(["-", "-", "-", "-"].iter().map(|s| s.to_string())),
            }
            out.push(row.cumulative.ccc.to_string());
            out.push(row.cumulative.cce.to_string());
            out.push(format!("{:.1}", row.cumulative.cpe));
            out.push(format!("{:.2}", row.cumulative.cgpa));
            out.push(row.remark.clone());
            grid.push(out);
        }
    }
    grid
}

pub fn grade_summary_grid(model: &GradeSummaryModel) -> Vec<Vec<String>> {
    let mut grid: Vec<Vec<String>> = Vec::new();
    for line in &model.letterhead.lines {
        grid.push(vec![line.clone()]);
    }
    grid.push(vec![model.letterhead.title.clone()]);
    grid.push(vec![model.letterhead.subtitle.clone()]);
    grid.push(vec![String::new()]);

    grid.push(
        [
            "Course", "Title", "Unit", "Registered", "A", "B", "C", "D", "E", "F", "% Pass",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    );
    for page in &model.pages {
        for row in &page.rows {
            grid.push(vec![
                row.code.clone(),
                row.title.clone(),
                row.unit.to_string(),
                row.distribution.registered.to_string(),
                row.distribution.a.to_string(),
                row.distribution.b.to_string(),
                row.distribution.c.to_string(),
                row.distribution.d.to_string(),
                row.distribution.e.to_string(),
                row.distribution.f.to_string(),
                format!("{:.1}", row.distribution.percent_pass),
            ]);
        }
    }
    grid
}

pub fn write_csv(grid: &[Vec<String>], out_path: &Path) -> anyhow::Result<FileExportSummary> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(out_path)
        .with_context(|| format!("failed to create {}", out_path.to_string_lossy()))?;
    for row in grid {
        writer
            .write_record(row.iter().map(|s| s.as_str()))
            .context("failed to write CSV record")?;
    }
    writer.flush().context("failed to flush CSV output")?;
    Ok(FileExportSummary {
        row_count: grid.len(),
    })
}

/// Writes the grid as a minimal single-sheet SpreadsheetML package. Cells
/// that parse as numbers become numeric cells; everything else is an inline
/// string.
pub fn write_xlsx(
    sheet_name: &str,
    grid: &[Vec<String>],
    out_path: &Path,
) -> anyhow::Result<FileExportSummary> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let out_file = std::fs::File::create(out_path)
        .with_context(|| format!("failed to create {}", out_path.to_string_lossy()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file("[Content_Types].xml", opts)
        .context("failed to start content types entry")?;
    zip.write_all(CONTENT_TYPES_XML.as_bytes())
        .context("failed to write content types")?;

    zip.start_file("_rels/.rels", opts)
        .context("failed to start package rels entry")?;
    zip.write_all(PACKAGE_RELS_XML.as_bytes())
        .context("failed to write package rels")?;

    zip.start_file("xl/workbook.xml", opts)
        .context("failed to start workbook entry")?;
    zip.write_all(workbook_xml(sheet_name).as_bytes())
        .context("failed to write workbook")?;

    zip.start_file("xl/_rels/workbook.xml.rels", opts)
        .context("failed to start workbook rels entry")?;
    zip.write_all(WORKBOOK_RELS_XML.as_bytes())
        .context("failed to write workbook rels")?;

    zip.start_file("xl/worksheets/sheet1.xml", opts)
        .context("failed to start worksheet entry")?;
    zip.write_all(sheet_xml(grid).as_bytes())
        .context("failed to write worksheet")?;

    zip.finish().context("failed to finalize xlsx package")?;
    Ok(FileExportSummary {
        row_count: grid.len(),
    })
}

const CONTENT_TYPES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">
<Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>
<Default Extension="xml" ContentType="application/xml"/>
<Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/>
<Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>
</Types>"#;

const PACKAGE_RELS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/>
</Relationships>"#;

const WORKBOOK_RELS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/>
</Relationships>"#;

fn workbook_xml(sheet_name: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">
<sheets><sheet name="{}" sheetId="1" r:id="rId1"/></sheets>
</workbook>"#,
        xml_escape(sheet_name)
    )
}

fn sheet_xml(grid: &[Vec<String>]) -> String {
    let mut body = String::new();
    body.push_str(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
<sheetData>"#,
    );
    for (i, row) in grid.iter().enumerate() {
        body.push_str(&format!("<row r=\"{}\">", i + 1));
        for cell in row {
            if !cell.is_empty() && cell.parse::<f64>().is_ok() {
                body.push_str(&format!("<c><v>{}</v></c>", cell));
            } else {
                body.push_str(&format!(
                    "<c t=\"inlineStr\"><is><t>{}</t></is></c>",
                    xml_escape(cell)
                ));
            }
        }
        body.push_str("</row>");
    }
    body.push_str("</sheetData></worksheet>");
    body
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
