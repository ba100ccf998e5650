#![forbid(unsafe_code)]

use std::io;

/// How list verbs render their rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Csv,
}

/// Column-aligned listing of records.
#[derive(Debug, Default)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn row(&mut self, cells: impl IntoIterator<Item = impl Into<String>>) {
        self.rows.push(cells.into_iter().map(Into::into).collect());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Writes to stdout in `format`.
    pub fn print(&self, format: OutputFormat) -> io::Result<()> {
        let out = io::stdout().lock();
        match format {
            OutputFormat::Table => self.write_aligned(out),
            OutputFormat::Csv => self.write_csv(out),
        }
    }

    /// Writes to a new file at `path` in `format`.
    pub fn write_to(&self, path: &std::path::Path, format: OutputFormat) -> io::Result<()> {
        let file = io::BufWriter::new(std::fs::File::create(path)?);
        match format {
            OutputFormat::Table => self.write_aligned(file),
            OutputFormat::Csv => self.write_csv(file),
        }
    }

    fn write_csv(&self, out: impl io::Write) -> io::Result<()> {
        let mut wtr = csv::Writer::from_writer(out);
        wtr.write_record(&self.headers)?;
        for row in &self.rows {
            wtr.write_record(row)?;
        }
        wtr.flush()
    }

    fn write_aligned(&self, mut out: impl io::Write) -> io::Result<()> {
        let widths = self.column_widths();
        writeln!(out, "{}", pad_row(&self.headers, &widths))?;
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        writeln!(out, "{}", pad_row(&rule, &widths))?;
        for row in &self.rows {
            writeln!(out, "{}", pad_row(row, &widths))?;
        }
        Ok(())
    }

    fn column_widths(&self) -> Vec<usize> {
        let columns = self
            .rows
            .iter()
            .map(Vec::len)
            .chain(std::iter::once(self.headers.len()))
            .max()
            .unwrap_or(0);
        let mut widths = vec![0usize; columns];
        for row in std::iter::once(&self.headers).chain(&self.rows) {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }
        widths
    }
}

fn pad_row(cells: &[String], widths: &[usize]) -> String {
    let last = cells.len().saturating_sub(1);
    let mut line = String::new();
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            line.push_str("  ");
        }
        line.push_str(cell);
        // No trailing padding on the last column.
        if i < last {
            let pad = widths.get(i).copied().unwrap_or(0);
            line.push_str(&" ".repeat(pad.saturating_sub(cell.chars().count())));
        }
    }
    line
}

/// First eight characters of an id, the length the list verbs show.
#[must_use]
pub fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

#[must_use]
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_owned();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(t: &Table, format: OutputFormat) -> String {
        let mut buf = Vec::new();
        match format {
            OutputFormat::Table => t.write_aligned(&mut buf).unwrap(),
            OutputFormat::Csv => t.write_csv(&mut buf).unwrap(),
        }
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn aligned_columns_pad_to_widest_cell() {
        let mut t = Table::new(["ID", "MESSAGE"]);
        t.row(["abc", "first"]);
        t.row(["a", "second snapshot"]);
        let text = render(&t, OutputFormat::Table);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ID   MESSAGE");
        assert_eq!(lines[1], "---  ---------------");
        assert_eq!(lines[2], "abc  first");
        assert_eq!(lines[3], "a    second snapshot");
    }

    #[test]
    fn csv_quotes_embedded_commas() {
        let mut t = Table::new(["ID", "RESULTS"]);
        t.row(["1", "acc=0.1, loss=2"]);
        assert_eq!(
            render(&t, OutputFormat::Csv),
            "ID,RESULTS\n1,\"acc=0.1, loss=2\"\n"
        );
    }

    #[test]
    fn write_to_creates_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("snapshot_ls");
        let mut t = Table::new(["ID"]);
        t.row(["abc"]);
        t.write_to(&path, OutputFormat::Csv).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ID\nabc\n");
    }

    #[test]
    fn helpers_shorten() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world", 5), "hello...");
    }
}
