/// Data layer: counter rows, status words, masks and filtering.
///
/// Architecture:
/// ```text
///  .csv / .parquet         mask .csv
///        │                     │
///        ▼                     ▼
///   ┌──────────┐          ┌──────────┐
///   │  loader   │          │   mask   │  manual exclusions (bits 24-31)
///   └──────────┘          └──────────┘
///        │ Vec<RawRow>         │
///        ▼                     ▼
///   ┌──────────────────────────────┐
///   │ SampleTable                  │  samples + status words,
///   │                              │  cached good-point views
///   └──────────────────────────────┘
///        ▲
///        │
///   ┌──────────┐
///   │  filter   │  unlock/outlier rejection, critical transfer, gather
///   └──────────┘
/// ```

pub mod loader;
pub mod model;
pub mod filter;
pub mod mask;
