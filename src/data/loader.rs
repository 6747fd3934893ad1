use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{Array, AsArray, Float32Array, Float64Array, Int64Array, StringArray};
use arrow::datatypes::DataType;
use log::info;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use super::model::{RawRow, MAX_CHANNELS};

/// Leading columns of every counter file, before the frequency columns.
pub const FIXED_COLUMNS: [&str; 3] = ["tstr", "stat", "time"];

/// Rows of one counter file plus the names of its frequency columns.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterFile {
    pub channel_names: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl CounterFile {
    pub fn channel_count(&self) -> usize {
        self.channel_names.len()
    }
}

// ---------------------------------------------------------------------------
// Public entry-point
// ---------------------------------------------------------------------------

/// Load a frequency counter file.  Dispatch by extension.
///
/// Supported formats:
/// * `.csv` / `.txt` – header row, then `timestamp, status, time, freq1..freqN`
/// * `.parquet`      – string columns `tstr`, `stat`, a float `time` column and
///                     one float column per channel
pub fn load_file(path: &Path) -> Result<CounterFile> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let file = match ext.as_str() {
        "parquet" | "pq" => load_parquet(path),
        "csv" | "txt" => load_csv(path),
        other => bail!("Unsupported file extension: .{other}"),
    }
    .with_context(|| format!("loading {}", path.display()))?;

    if file.channel_count() == 0 || file.channel_count() > MAX_CHANNELS {
        bail!(
            "{} has {} frequency columns, expected 1 to {MAX_CHANNELS}",
            path.display(),
            file.channel_count()
        );
    }
    info!(
        "Loaded {} rows, {} channels from {}",
        file.rows.len(),
        file.channel_count(),
        path.display()
    );
    Ok(file)
}

// ---------------------------------------------------------------------------
// CSV loader
// ---------------------------------------------------------------------------

/// Column names in the header are free; only their positions matter.
/// Empty frequency cells read as NaN.
fn load_csv(path: &Path) -> Result<CounterFile> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .context("opening CSV")?;
    let headers = reader.headers().context("reading CSV headers")?.clone();
    if headers.len() <= FIXED_COLUMNS.len() {
        bail!(
            "CSV header has {} columns, need timestamp, status, time and at least one frequency",
            headers.len()
        );
    }
    let channel_names: Vec<String> = headers
        .iter()
        .skip(FIXED_COLUMNS.len())
        .map(|h| h.to_string())
        .collect();

    let mut rows = Vec::new();
    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row_no}"))?;
        let time = parse_float(record.get(2).unwrap_or(""))
            .with_context(|| format!("CSV row {row_no}: invalid time"))?;
        let values = record
            .iter()
            .skip(FIXED_COLUMNS.len())
            .enumerate()
            .map(|(j, tok)| {
                parse_float(tok).with_context(|| {
                    format!("CSV row {row_no}, {}: '{tok}' is not a number", channel_names[j])
                })
            })
            .collect::<Result<Vec<f64>>>()?;

        rows.push(RawRow {
            timestamp: record.get(0).unwrap_or("").to_string(),
            status: record.get(1).unwrap_or("").to_string(),
            time,
            values,
        });
    }

    Ok(CounterFile {
        channel_names,
        rows,
    })
}

fn parse_float(tok: &str) -> Result<f64> {
    if tok.is_empty() {
        return Ok(f64::NAN);
    }
    Ok(tok.parse::<f64>()?)
}

// ---------------------------------------------------------------------------
// Parquet loader
// ---------------------------------------------------------------------------

/// Load a Parquet file with the counter columns.
///
/// Expected schema:
/// - `tstr`: Utf8 – timestamp as written by the counter (optional)
/// - `stat`: Utf8 – counter status, `GOOD` for valid rows
/// - `time`: Float64 or Int64 – Unix time (s)
/// - every other column: Float64 or Float32 frequency, in schema order
fn load_parquet(path: &Path) -> Result<CounterFile> {
    let file = std::fs::File::open(path).context("opening parquet file")?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).context("reading parquet metadata")?;
    let reader = builder.build().context("building parquet reader")?;

    let mut channel_names: Option<Vec<String>> = None;
    let mut rows = Vec::new();

    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        let schema = batch.schema();

        let stat_idx = schema
            .index_of("stat")
            .map_err(|_| anyhow::anyhow!("Parquet file missing 'stat' column"))?;
        let time_idx = schema
            .index_of("time")
            .map_err(|_| anyhow::anyhow!("Parquet file missing 'time' column"))?;
        let tstr_idx = schema.index_of("tstr").ok();

        let freq_cols: Vec<(usize, String)> = schema
            .fields()
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != stat_idx && *i != time_idx && Some(*i) != tstr_idx)
            .map(|(i, f)| (i, f.name().clone()))
            .collect();
        let names: Vec<String> = freq_cols.iter().map(|(_, n)| n.clone()).collect();
        match &channel_names {
            Some(known) if *known != names => bail!("Record batches disagree on frequency columns"),
            Some(_) => {}
            None => channel_names = Some(names),
        }

        let stat = extract_strings(batch.column(stat_idx)).context("column 'stat'")?;
        let time = extract_f64(batch.column(time_idx)).context("column 'time'")?;
        let tstr = match tstr_idx {
            Some(i) => extract_strings(batch.column(i)).context("column 'tstr'")?,
            None => vec![String::new(); batch.num_rows()],
        };
        let freqs = freq_cols
            .iter()
            .map(|(i, name)| {
                extract_f64(batch.column(*i)).with_context(|| format!("column '{name}'"))
            })
            .collect::<Result<Vec<Vec<f64>>>>()?;

        for row in 0..batch.num_rows() {
            rows.push(RawRow {
                timestamp: tstr[row].clone(),
                status: stat[row].clone(),
                time: time[row],
                values: freqs.iter().map(|col| col[row]).collect(),
            });
        }
    }

    Ok(CounterFile {
        channel_names: channel_names.unwrap_or_default(),
        rows,
    })
}

// -- Parquet / Arrow helpers --

/// Float column as `Vec<f64>`, nulls as NaN.
fn extract_f64(col: &Arc<dyn Array>) -> Result<Vec<f64>> {
    if let Some(arr) = col.as_any().downcast_ref::<Float64Array>() {
        Ok(arr.iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    } else if let Some(arr) = col.as_any().downcast_ref::<Float32Array>() {
        Ok(arr.iter().map(|v| v.map_or(f64::NAN, f64::from)).collect())
    } else if let Some(arr) = col.as_any().downcast_ref::<Int64Array>() {
        Ok(arr.iter().map(|v| v.map_or(f64::NAN, |i| i as f64)).collect())
    } else {
        bail!("Column type is {:?}, expected Float64 or Float32", col.data_type())
    }
}

/// String column as `Vec<String>`, nulls as empty strings.
fn extract_strings(col: &Arc<dyn Array>) -> Result<Vec<String>> {
    let values = match col.data_type() {
        DataType::Utf8 => {
            let arr = col
                .as_any()
                .downcast_ref::<StringArray>()
                .context("expected StringArray")?;
            arr.iter().map(|v| v.unwrap_or("").to_string()).collect()
        }
        DataType::LargeUtf8 => col
            .as_string::<i64>()
            .iter()
            .map(|v| v.unwrap_or("").to_string())
            .collect(),
        other => bail!("Expected a string column, got {other:?}"),
    };
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{Field, Schema};
    use arrow::record_batch::RecordBatch;
    use parquet::arrow::ArrowWriter;

    #[test]
    fn test_load_csv_counter_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("freq.csv");
        std::fs::write(
            &path,
            "tstr, stat, time, f1, f2\n\
             170913 010000.000, GOOD, 1505264400.0, 20000001.5, 250000000.01\n\
             170913 010001.000, UNLOCK, 1505264401.0, , 249999999.99\n",
        )
        .unwrap();
        let file = load_file(&path).unwrap();
        assert_eq!(file.channel_names, vec!["f1", "f2"]);
        assert_eq!(file.rows.len(), 2);
        assert_eq!(file.rows[0].status, "GOOD");
        assert_eq!(file.rows[0].values, vec![20000001.5, 250000000.01]);
        assert_eq!(file.rows[1].time, 1505264401.0);
        assert!(file.rows[1].values[0].is_nan());
    }

    #[test]
    fn test_load_csv_rejects_text_in_frequency_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("freq.csv");
        std::fs::write(&path, "tstr,stat,time,f1\nx,GOOD,1.0,abc\n").unwrap();
        let err = load_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("'abc' is not a number"));
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(load_file(Path::new("data.xlsx")).is_err());
    }

    #[test]
    fn test_load_parquet_counter_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("freq.parquet");
        let schema = Arc::new(Schema::new(vec![
            Field::new("tstr", DataType::Utf8, false),
            Field::new("stat", DataType::Utf8, false),
            Field::new("time", DataType::Float64, false),
            Field::new("ceo", DataType::Float64, true),
            Field::new("rep", DataType::Float32, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec!["a", "b"])),
                Arc::new(StringArray::from(vec!["GOOD", "BAD"])),
                Arc::new(Float64Array::from(vec![10.0, 11.0])),
                Arc::new(Float64Array::from(vec![Some(1.5), None])),
                Arc::new(Float32Array::from(vec![2.0, 3.0])),
            ],
        )
        .unwrap();
        let mut writer = ArrowWriter::try_new(std::fs::File::create(&path).unwrap(), schema, None)
            .unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let file = load_file(&path).unwrap();
        assert_eq!(file.channel_names, vec!["ceo", "rep"]);
        assert_eq!(file.rows[0].timestamp, "a");
        assert_eq!(file.rows[0].values, vec![1.5, 2.0]);
        assert_eq!(file.rows[1].status, "BAD");
        assert!(file.rows[1].values[0].is_nan());
    }
}
