//! Writes a synthetic four-channel comb counter record to
//! `sample_data.parquet` and `sample_data.csv`, together with a matching
//! `sample_config.toml`.

use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::DateTime;
use parquet::arrow::ArrowWriter;

/// 2020-09-13 08:00:00 UTC
const START: f64 = 1_599_984_000.0;
const ROWS: usize = 7200;

/// Column name, nominal frequency (Hz), white noise (Hz).
const CHANNELS: [(&str, f64, f64); 4] = [
    ("f_CEO", 20e6, 0.05),
    ("f_rep", 250e6, 2e-4),
    ("Sr_beat", 15_770_127.0, 0.3),
    ("Yb_beat", 66_590_863.6, 0.4),
];

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5))
            .rotate_left(7)
            .wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }
}

struct Record {
    tstr: Vec<String>,
    stat: Vec<String>,
    time: Vec<f64>,
    freqs: Vec<Vec<f64>>,
}

fn generate(rng: &mut SimpleRng) -> Record {
    let mut record = Record {
        tstr: Vec::with_capacity(ROWS),
        stat: Vec::with_capacity(ROWS),
        time: Vec::with_capacity(ROWS),
        freqs: vec![Vec::with_capacity(ROWS); CHANNELS.len()],
    };

    // cycle slip of the CEO lock and a short counter dropout
    let unlocked = 3000..3004;
    let dropout = 5100..5103;

    for i in 0..ROWS {
        let t = START + i as f64;
        record.time.push(t);
        record.tstr.push(
            DateTime::from_timestamp(t as i64, 0)
                .map(|d| d.format("%y%m%d %H%M%S.000").to_string())
                .unwrap_or_default(),
        );
        record.stat.push(if dropout.contains(&i) { "BAD" } else { "GOOD" }.to_string());

        for (ch, &(_, nominal, noise)) in CHANNELS.iter().enumerate() {
            let mut value = rng.gauss(nominal, noise);
            if ch == 0 && unlocked.contains(&i) {
                value += 2.5e4;
            }
            // isolated glitch on the Sr beat
            if ch == 2 && i == 4500 {
                value += 40.0;
            }
            record.freqs[ch].push(value);
        }
    }
    record
}

fn write_parquet(record: &Record, path: &str) -> Result<()> {
    let mut fields = vec![
        Field::new("tstr", DataType::Utf8, false),
        Field::new("stat", DataType::Utf8, false),
        Field::new("time", DataType::Float64, false),
    ];
    fields.extend(
        CHANNELS
            .iter()
            .map(|(name, _, _)| Field::new(*name, DataType::Float64, false)),
    );
    let schema = Arc::new(Schema::new(fields));

    let mut columns: Vec<Arc<dyn arrow::array::Array>> = vec![
        Arc::new(StringArray::from(
            record.tstr.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            record.stat.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(record.time.clone())),
    ];
    for col in &record.freqs {
        columns.push(Arc::new(Float64Array::from(col.clone())));
    }

    let batch =
        RecordBatch::try_new(schema.clone(), columns).context("Failed to create RecordBatch")?;
    let file = std::fs::File::create(path).context("Failed to create output file")?;
    let mut writer = ArrowWriter::try_new(file, schema, None).context("Failed to create writer")?;
    writer.write(&batch).context("Failed to write batch")?;
    writer.close().context("Failed to close writer")?;
    Ok(())
}

fn write_csv(record: &Record, path: &str) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).context("Failed to create output file")?;
    let mut header = vec!["tstr", "stat", "time"];
    header.extend(CHANNELS.iter().map(|(name, _, _)| *name));
    writer.write_record(&header)?;
    for i in 0..record.time.len() {
        let mut line = vec![
            record.tstr[i].clone(),
            record.stat[i].clone(),
            format!("{:.3}", record.time[i]),
        ];
        line.extend(record.freqs.iter().map(|col| format!("{:.6}", col[i])));
        writer.write_record(&line)?;
    }
    writer.flush()?;
    Ok(())
}

const CONFIG: &str = r#"[config]
ceo_channel = 1
rep_channel = 2

[[channel]]
name = "f_CEO"
baseline = 20000000
tolerance = 100.0
filter = true
adev_reference = 20e6

[[channel]]
name = "f_rep"
baseline = 250000000
tolerance = 1.0
filter = true
adev_reference = 250e6

[[channel]]
name = "Sr_beat"
baseline = 15770127
tolerance = 1000.0
adev_reference = 429e12

[[channel]]
name = "Yb_beat"
baseline = "66590863.6"
tolerance = 1000.0
adev_reference = 518e12

[[evaluation]]
name = "Sr"
type = "absolute"
main_comb_line = 1716912
main_beat_channel = -3
main_reference = "429228004229873.0"

[[evaluation]]
name = "Yb/Sr"
type = "ratio"
main_comb_line = 2073183
main_beat_channel = 4
main_reference = "518295836590863.6"
ref_comb_line = 1716912
ref_beat_channel = -3
ref_reference = "429228004229873.0"
"#;

fn main() -> Result<()> {
    let mut rng = SimpleRng::new(42);
    let record = generate(&mut rng);

    write_parquet(&record, "sample_data.parquet")?;
    write_csv(&record, "sample_data.csv")?;
    std::fs::write("sample_config.toml", CONFIG).context("Failed to write configuration")?;

    println!(
        "Wrote {} samples of {} channels to sample_data.parquet and sample_data.csv",
        record.time.len(),
        CHANNELS.len()
    );
    Ok(())
}
