#![forbid(unsafe_code)]

use std::io;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Csv,
}

impl OutputFormat {
    #[must_use]
    pub fn from_flags(json: bool, csv: bool) -> Self {
        if json {
            Self::Json
        } else if csv {
            Self::Csv
        } else {
            Self::Table
        }
    }
}

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

    pub fn row(&mut self, cols: impl IntoIterator<Item = impl Into<String>>) {
        self.rows.push(cols.into_iter().map(Into::into).collect());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Prints `items` as pretty JSON, or this table as text or CSV.
    pub fn emit<T: Serialize>(&self, format: OutputFormat, items: &[T]) -> anyhow::Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        match format {
            OutputFormat::Json => {
                serde_json::to_writer_pretty(&mut out, items)?;
                io::Write::write_all(&mut out, b"\n")?;
            }
            OutputFormat::Csv => self.write_csv(&mut out)?,
            OutputFormat::Table => self.write_text(&mut out)?,
        }
        Ok(())
    }

    pub fn write_csv(&self, out: impl io::Write) -> io::Result<()> {
        let mut wtr = csv::Writer::from_writer(out);
        wtr.write_record(&self.headers)?;
        for row in &self.rows {
            wtr.write_record(row)?;
        }
        wtr.flush()
    }

    pub fn write_text(&self, mut out: impl io::Write) -> io::Result<()> {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                let w = cell.chars().count();
                match widths.get_mut(i) {
                    Some(cur) => *cur = (*cur).max(w),
                    None => widths.push(w),
                }
            }
        }

        writeln!(out, "{}", format_row(&self.headers, &widths))?;
        for row in &self.rows {
            writeln!(out, "{}", format_row(row, &widths))?;
        }
        Ok(())
    }
}

fn format_row(row: &[String], widths: &[usize]) -> String {
    let mut out = String::new();
    for (i, cell) in row.iter().enumerate() {
        if i > 0 {
            out.push_str("  ");
        }
        out.push_str(cell);
        // No trailing padding on the last column.
        if i + 1 < row.len() {
            let pad = widths
                .get(i)
                .copied()
                .unwrap_or(0)
                .saturating_sub(cell.chars().count());
            out.extend(std::iter::repeat_n(' ', pad));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        let mut t = Table::new(["ID", "STATE", "ROBOT"]);
        t.row(["T-1", "CLAIMED", "R1"]);
        t.row(["T-22", "READY", "-"]);
        t
    }

    #[test]
    fn text_columns_are_aligned() {
        let mut buf = Vec::new();
        sample().write_text(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ID    STATE    ROBOT");
        assert_eq!(lines[1], "T-1   CLAIMED  R1");
        assert_eq!(lines[2], "T-22  READY    -");
    }

    #[test]
    fn csv_quotes_cells_with_commas() {
        let mut t = Table::new(["ID", "WAYPOINTS"]);
        t.row(["T-1", "Kitchen,Table 2"]);
        let mut buf = Vec::new();
        t.write_csv(&mut buf).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "ID,WAYPOINTS\nT-1,\"Kitchen,Table 2\"\n"
        );
    }

    #[test]
    fn json_flag_wins() {
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Csv);
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Table);
    }
}
