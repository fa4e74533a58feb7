use crate::error::ReportError;
use crate::failure::{Failure, FailureLog};
use crate::metric::{ChartImage, MetricDescriptor, SummaryStatistics};
use chrono::{DateTime, Utc};
use rust_xlsxwriter::{Color, Format, Image, Workbook as XlsxWorkbook, Worksheet};
use std::collections::HashSet;

pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

const MAX_SHEET_NAME: usize = 31;
const INDEX_SHEET: &str = "Index";
const NO_DATA_SHEET: &str = "No data";
const RESERVED_SHEETS: [&str; 3] = [INDEX_SHEET, NO_DATA_SHEET, "History"];
const ROW_HEIGHT_PX: u32 = 20;
const BLOCK_COLUMNS: u16 = 3;
const FIRST_ENTRY_ROW: u32 = 3;
const SUMMARY_ROWS: u32 = 6;

#[derive(Debug, Clone, PartialEq)]
pub enum Summary {
    Computed(SummaryStatistics),
    /// The series exists but had no datapoints in the window.
    NoData,
    /// Only a widget image was fetched, so there are no numbers to show.
    Omitted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryContent {
    Chart { image: ChartImage, summary: Summary },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SheetEntry {
    pub descriptor: MetricDescriptor,
    pub content: EntryContent,
}

impl SheetEntry {
    pub fn is_chart(&self) -> bool {
        matches!(self.content, EntryContent::Chart { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportSheet {
    pub name: String,
    pub namespace: String,
    pub entries: Vec<SheetEntry>,
    pub skipped: usize,
}

impl ReportSheet {
    pub fn charts(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_chart()).count()
    }

    pub fn failed(&self) -> usize {
        self.entries.len() - self.charts()
    }
}

/// Run parameters echoed into the document.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportContext {
    pub generated_at: DateTime<Utc>,
    pub lookback: String,
    pub period: i64,
    pub failures: FailureLog,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SheetLayout {
    pub images_per_row: u16,
    pub image_width: u32,
    pub image_height: u32,
}

impl SheetLayout {
    fn image_rows(&self) -> u32 {
        (self.image_height + ROW_HEIGHT_PX - 1) / ROW_HEIGHT_PX
    }

    /// Rows taken by one entry: title, image, gap, summary table, spacer.
    fn block_rows(&self) -> u32 {
        1 + self.image_rows() + 1 + SUMMARY_ROWS + 1
    }

    fn column_width(&self) -> f64 {
        let per_column_px = self.image_width as f64 / BLOCK_COLUMNS as f64;
        (per_column_px / 7.0).ceil().max(12.0)
    }

    /// Top-left cell of the entry at `index`.
    fn anchor(&self, index: usize) -> (u32, u16) {
        let per_row = self.images_per_row.max(1) as usize;
        let grid_row = (index / per_row) as u32;
        let grid_col = (index % per_row) as u16;
        (
            FIRST_ENTRY_ROW + grid_row * self.block_rows(),
            grid_col * BLOCK_COLUMNS,
        )
    }
}

pub struct WorkbookBuilder {
    context: ReportContext,
    layout: SheetLayout,
    sheets: Vec<ReportSheet>,
    taken: HashSet<String>,
}

impl WorkbookBuilder {
    pub fn new(context: ReportContext, layout: SheetLayout) -> Self {
        WorkbookBuilder {
            context,
            layout,
            sheets: vec![],
            taken: RESERVED_SHEETS.iter().map(|name| name.to_lowercase()).collect(),
        }
    }

    /// Adds the sheet for `namespace` and returns its (sanitized, unique) name.
    pub fn add_sheet(&mut self, namespace: &str, entries: Vec<SheetEntry>, skipped: usize) -> &str {
        let name = self.unique_name(&sanitize_sheet_name(namespace));
        self.sheets.push(ReportSheet {
            name,
            namespace: namespace.to_string(),
            entries,
            skipped,
        });
        &self.sheets[self.sheets.len() - 1].name
    }

    pub fn build(self) -> Workbook {
        Workbook {
            sheets: self.sheets,
            generated_at: self.context.generated_at,
            context: self.context,
            layout: self.layout,
        }
    }

    pub fn finalize(self) -> Result<Vec<u8>, ReportError> {
        self.build().serialize()
    }

    fn unique_name(&mut self, base: &str) -> String {
        if self.taken.insert(base.to_lowercase()) {
            return base.to_string();
        }
        let mut n = 2;
        loop {
            let suffix = format!("_{}", n);
            let stem: String = base.chars().take(MAX_SHEET_NAME - suffix.len()).collect();
            let candidate = format!("{}{}", stem, suffix);
            if self.taken.insert(candidate.to_lowercase()) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Replaces characters xlsx sheet names cannot hold and enforces the 31
/// character limit.
pub fn sanitize_sheet_name(namespace: &str) -> String {
    let cleaned: String = namespace
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let truncated: String = cleaned.trim().chars().take(MAX_SHEET_NAME).collect();
    let truncated = truncated.trim_end().to_string();
    if truncated.is_empty() {
        "Sheet".to_string()
    } else {
        truncated
    }
}

/// The finished report model. Serialized once into xlsx bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Workbook {
    pub sheets: Vec<ReportSheet>,
    pub generated_at: DateTime<Utc>,
    context: ReportContext,
    layout: SheetLayout,
}

impl Workbook {
    pub fn charts(&self) -> usize {
        self.sheets.iter().map(ReportSheet::charts).sum()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ReportError> {
        let mut workbook = XlsxWorkbook::new();
        let bold = Format::new().set_bold();
        let failed = Format::new().set_italic().set_font_color(Color::RGB(0xC0_00_00));
        let number = Format::new().set_num_format("#,##0.00");

        if self.sheets.is_empty() {
            let worksheet = workbook.add_worksheet();
            worksheet.set_name(NO_DATA_SHEET)?;
            worksheet.write_string_with_format(0, 0, "No metrics were found for this report.", &bold)?;
            worksheet.set_column_width(0, 24)?;
            self.write_run_info(worksheet, 2)?;
            self.write_failures(worksheet, 6, &bold)?;
            return Ok(workbook.save_to_buffer()?);
        }

        for sheet in &self.sheets {
            let worksheet = workbook.add_worksheet();
            worksheet.set_name(&sheet.name)?;
            self.write_sheet(worksheet, sheet, &bold, &failed, &number)?;
        }

        let index = workbook.add_worksheet();
        index.set_name(INDEX_SHEET)?;
        self.write_index(index, &bold)?;

        Ok(workbook.save_to_buffer()?)
    }

    fn write_sheet(
        &self,
        worksheet: &mut Worksheet,
        sheet: &ReportSheet,
        bold: &Format,
        failed: &Format,
        number: &Format,
    ) -> Result<(), ReportError> {
        let columns = self.layout.images_per_row.max(1).saturating_mul(BLOCK_COLUMNS);
        for column in 0..columns {
            worksheet.set_column_width(column, self.layout.column_width())?;
        }
        worksheet.write_string_with_format(0, 0, &sheet.namespace, bold)?;
        worksheet.write_string(
            1,
            0,
            &format!(
                "{} metrics, {} charts, {} failed, {} skipped by cap",
                sheet.entries.len(),
                sheet.charts(),
                sheet.failed(),
                sheet.skipped
            ),
        )?;

        for (index, entry) in sheet.entries.iter().enumerate() {
            let (row, col) = self.layout.anchor(index);
            worksheet.write_string_with_format(row, col, &entry.descriptor.title(), bold)?;
            match &entry.content {
                EntryContent::Chart { image, summary } => {
                    let picture = Image::new_from_buffer(&image.png)?;
                    worksheet.insert_image(row + 1, col, &picture)?;
                    let table_row = row + 2 + self.layout.image_rows();
                    write_summary(worksheet, table_row, col, summary, number)?;
                }
                EntryContent::Failed { reason } => {
                    worksheet.write_string_with_format(row + 1, col, reason, failed)?;
                }
            }
        }
        Ok(())
    }

    fn write_run_info(&self, worksheet: &mut Worksheet, row: u32) -> Result<(), ReportError> {
        worksheet.write_string(row, 0, "Generated")?;
        worksheet.write_string(row, 1, &self.generated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string())?;
        worksheet.write_string(row + 1, 0, "Lookback")?;
        worksheet.write_string(row + 1, 1, &self.context.lookback)?;
        worksheet.write_string(row + 2, 0, "Period(s)")?;
        worksheet.write_number(row + 2, 1, self.context.period as f64)?;
        Ok(())
    }

    fn write_index(&self, worksheet: &mut Worksheet, bold: &Format) -> Result<(), ReportError> {
        worksheet.set_column_width(0, 24)?;
        worksheet.set_column_width(1, 24)?;
        self.write_run_info(worksheet, 0)?;

        let header_row = 4;
        let headers = ["Namespace", "Sheet", "Metrics", "Charts", "Failed", "Skipped (cap)"];
        for (col, header) in headers.iter().enumerate() {
            worksheet.write_string_with_format(header_row, col as u16, *header, bold)?;
        }
        let mut row = header_row + 1;
        for sheet in &self.sheets {
            worksheet.write_string(row, 0, &sheet.namespace)?;
            worksheet.write_string(row, 1, &sheet.name)?;
            worksheet.write_number(row, 2, sheet.entries.len() as f64)?;
            worksheet.write_number(row, 3, sheet.charts() as f64)?;
            worksheet.write_number(row, 4, sheet.failed() as f64)?;
            worksheet.write_number(row, 5, sheet.skipped as f64)?;
            row += 1;
        }
        self.write_failures(worksheet, row + 1, bold)
    }

    fn write_failures(&self, worksheet: &mut Worksheet, row: u32, bold: &Format) -> Result<(), ReportError> {
        if self.context.failures.is_empty() {
            return Ok(());
        }
        worksheet.write_string_with_format(row, 0, "Failures", bold)?;
        worksheet.write_string_with_format(row + 1, 0, "Subject", bold)?;
        worksheet.write_string_with_format(row + 1, 1, "Kind", bold)?;
        worksheet.write_string_with_format(row + 1, 2, "Reason", bold)?;
        for (offset, failure) in self.context.failures.iter().enumerate() {
            write_failure(worksheet, row + 2 + offset as u32, failure)?;
        }
        Ok(())
    }
}

fn write_failure(worksheet: &mut Worksheet, row: u32, failure: &Failure) -> Result<(), ReportError> {
    worksheet.write_string(row, 0, &failure.subject)?;
    worksheet.write_string(row, 1, failure.kind.as_str())?;
    worksheet.write_string(row, 2, &failure.reason)?;
    Ok(())
}

fn write_summary(
    worksheet: &mut Worksheet,
    row: u32,
    col: u16,
    summary: &Summary,
    number: &Format,
) -> Result<(), ReportError> {
    match summary {
        Summary::Computed(stats) => {
            let values = [
                ("Min", stats.minimum),
                ("Max", stats.maximum),
                ("Average", stats.average),
                ("Last", stats.last),
            ];
            for (offset, (label, value)) in values.iter().enumerate() {
                let row = row + offset as u32;
                worksheet.write_string(row, col, *label)?;
                worksheet.write_number_with_format(row, col + 1, *value, number)?;
            }
            worksheet.write_string(row + 4, col, "Unit")?;
            worksheet.write_string(row + 4, col + 1, &stats.unit)?;
            worksheet.write_string(row + 5, col, "Samples")?;
            worksheet.write_number(row + 5, col + 1, stats.count as f64)?;
        }
        Summary::NoData => {
            worksheet.write_string(row, col, "No datapoints in window")?;
        }
        Summary::Omitted => {}
    }
    Ok(())
}
