//! Minimal PDF writer for tabular exports (Helvetica, A4 portrait).

use std::fmt::Write as _;

const PAGE_WIDTH: f64 = 595.0;
const PAGE_HEIGHT: f64 = 842.0;
const MARGIN: f64 = 50.0;
const LINE_HEIGHT: f64 = 15.0;
pub const ROWS_PER_PAGE: usize = 45;

pub struct Table<'a> {
    pub title: &'a str,
    pub subtitle: Option<&'a str>,
    pub headers: &'a [&'a str],
    /// Column x offsets from the left margin, one per header.
    pub columns: &'a [f64],
    pub rows: Vec<Vec<String>>,
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '(' | ')' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_ascii() && !c.is_ascii_control() => out.push(c),
            _ => out.push('?'),
        }
    }
    out
}

fn text_op(out: &mut String, x: f64, y: f64, size: u32, bold: bool, text: &str) {
    let font = if bold { "F2" } else { "F1" };
    let _ = writeln!(
        out,
        "BT /{} {} Tf {:.1} {:.1} Td ({}) Tj ET",
        font,
        size,
        x,
        y,
        escape(text)
    );
}

fn page_content(table: &Table<'_>, rows: &[Vec<String>], page_no: usize, page_count: usize) -> String {
    let mut s = String::new();
    let mut y = PAGE_HEIGHT - MARGIN;
    text_op(&mut s, MARGIN, y, 16, true, table.title);
    y -= LINE_HEIGHT * 1.5;
    if let Some(sub) = table.subtitle {
        text_op(&mut s, MARGIN, y, 10, false, sub);
        y -= LINE_HEIGHT * 1.5;
    }
    for (h, x) in table.headers.iter().zip(table.columns) {
        text_op(&mut s, MARGIN + x, y, 10, true, h);
    }
    y -= 4.0;
    let _ = writeln!(
        s,
        "{:.1} {:.1} m {:.1} {:.1} l S",
        MARGIN,
        y,
        PAGE_WIDTH - MARGIN,
        y
    );
    y -= LINE_HEIGHT;
    for row in rows {
        for (cell, x) in row.iter().zip(table.columns) {
            text_op(&mut s, MARGIN + x, y, 10, false, cell);
        }
        y -= LINE_HEIGHT;
    }
    text_op(
        &mut s,
        MARGIN,
        MARGIN / 2.0,
        8,
        false,
        &format!("Page {} of {}", page_no, page_count),
    );
    s
}

/// Render `table` into PDF bytes, paginating every `ROWS_PER_PAGE` rows.
pub fn render_table(table: &Table<'_>) -> Vec<u8> {
    let chunks: Vec<&[Vec<String>]> = if table.rows.is_empty() {
        vec![&table.rows[..0]]
    } else {
        table.rows.chunks(ROWS_PER_PAGE).collect()
    };
    let page_count = chunks.len();

    // Object layout: 1 catalog, 2 pages, 3-4 fonts, then (page, content) pairs.
    let mut objects: Vec<String> = Vec::new();
    let kids: Vec<String> = (0..page_count)
        .map(|i| format!("{} 0 R", 5 + i * 2))
        .collect();
    objects.push("<< /Type /Catalog /Pages 2 0 R >>".to_string());
    objects.push(format!(
        "<< /Type /Pages /Kids [{}] /Count {} >>",
        kids.join(" "),
        page_count
    ));
    objects.push("<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string());
    objects.push("<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica-Bold >>".to_string());
    for (i, rows) in chunks.iter().enumerate() {
        let content_id = 6 + i * 2;
        objects.push(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {} {}] /Resources << /Font << /F1 3 0 R /F2 4 0 R >> >> /Contents {} 0 R >>",
            PAGE_WIDTH, PAGE_HEIGHT, content_id
        ));
        let content = page_content(table, rows, i + 1, page_count);
        objects.push(format!(
            "<< /Length {} >>\nstream\n{}endstream",
            content.len(),
            content
        ));
    }

    let mut out = String::from("%PDF-1.4\n");
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        let _ = write!(out, "{} 0 obj\n{}\nendobj\n", i + 1, body);
    }
    let xref_at = out.len();
    let _ = write!(out, "xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1);
    for off in offsets {
        let _ = write!(out, "{:010} 00000 n \n", off);
    }
    let _ = write!(
        out,
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
        objects.len() + 1,
        xref_at
    );
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: usize) -> Table<'static> {
        Table {
            title: "Results (Final)",
            subtitle: Some("Class 5"),
            headers: &["Student", "Marks"],
            columns: &[0.0, 200.0],
            rows: (0..rows)
                .map(|i| vec![format!("Student {}", i), format!("{}", i)])
                .collect(),
        }
    }

    #[test]
    fn document_is_framed_and_paginated() {
        let bytes = render_table(&table(ROWS_PER_PAGE + 1));
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("%PDF-1.4\n"));
        assert!(text.ends_with("%%EOF\n"));
        assert!(text.contains("/Count 2"));
        assert!(text.contains("Page 2 of 2"));
    }

    #[test]
    fn escapes_parentheses() {
        let text = String::from_utf8(render_table(&table(0))).unwrap();
        assert!(text.contains("(Results \\(Final\\)) Tj"));
        assert!(text.contains("/Count 1"));
    }

    #[test]
    fn xref_offsets_point_at_objects() {
        let bytes = render_table(&table(3));
        let text = String::from_utf8(bytes).unwrap();
        let xref_pos: usize = text
            .lines()
            .skip_while(|l| *l != "startxref")
            .nth(1)
            .unwrap()
            .parse()
            .unwrap();
        assert!(text[xref_pos..].starts_with("xref"));
        let first_entry = text[xref_pos..].lines().nth(3).unwrap();
        let off: usize = first_entry[..10].parse().unwrap();
        assert!(text[off..].starts_with("1 0 obj"));
    }
}
