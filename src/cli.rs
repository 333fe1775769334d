//! Command Line Interface helpers for msreorder

use crate::{
    error::{
        CLIError::{InvalidCommandLineArgument, MissingCommandLineArgument},
        MsReorderError::{self, ClapError, DryRun},
    },
    io::VisTable,
    metadata::{MsMetadata, TimeInterval},
    reader::{BaselineReader, FlagWriteRequest, ReadMode, ReaderOptions, ReaderOptionsBuilder},
    selector,
};
use cfg_if::cfg_if;
use clap::{
    arg, command,
    ErrorKind::{ArgumentNotFound, DisplayHelp, DisplayVersion},
    ValueHint::{DirPath, FilePath},
};
use log::{debug, info, trace};
use marlu::ndarray::Array2;
use prettytable::{format as prettyformat, table};
use std::{
    ffi::OsString,
    fmt::{Debug, Display},
    path::PathBuf,
};

cfg_if! {
    if #[cfg(feature = "ms")] {
        use crate::io::MsTable;
    }
}

// Add build-time information from the "built" crate.
include!(concat!(env!("OUT_DIR"), "/built.rs"));

/// Write many info-level log lines of how this executable was compiled.
///
/// # Errors
///
/// propagates writeln! fails
pub fn fmt_build_info(f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match GIT_HEAD_REF {
        Some(hr) => {
            let dirty = GIT_DIRTY.unwrap_or(false);
            writeln!(
                f,
                "Compiled on git commit hash: {}{}",
                GIT_COMMIT_HASH.unwrap_or("<unknown>"),
                if dirty { " (dirty)" } else { "" }
            )?;
            writeln!(f, "            git head ref: {}", hr)?;
        }
        None => writeln!(f, "Compiled on git commit hash: <no git info>")?,
    }
    writeln!(f, "            {}", BUILT_TIME_UTC)?;
    writeln!(f, "         with compiler {}", RUSTC_VERSION)?;
    writeln!(f)?;
    Ok(())
}

/// What a run is about to do, printed before it starts.
struct Summary<'a> {
    ctx: &'a MsReorderContext,
    meta: &'a MsMetadata,
    mode: ReadMode,
    required_bytes: u64,
    total_memory: u64,
}

impl Display for Summary<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} version {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        )?;

        fmt_build_info(f)?;

        let meta = self.meta;
        writeln!(f, "Input:                {}", self.ctx.input.display())?;
        if let Some(name) = meta.telescope_name() {
            writeln!(f, "Telescope:            {}", name)?;
        }

        let total_timesteps: usize = (0..meta.sequence_count())
            .map(|seq| meta.timestep_count(seq))
            .sum();
        let mut shape_table = table!(
            ["rows", meta.num_rows()],
            ["antennas", meta.antenna_count()],
            ["baselines", meta.baselines().len()],
            ["bands", meta.band_count()],
            [
                "channels",
                meta.bands()
                    .iter()
                    .map(|b| b.channel_count().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ],
            [
                "polarizations",
                meta.polarizations()
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ],
            ["sequences", meta.sequence_count()],
            ["time steps", total_timesteps]
        );
        shape_table.set_format(*prettyformat::consts::FORMAT_CLEAN);
        writeln!(f, "Table shape:\n{}", shape_table)?;

        const GIB: f64 = 1024. * 1024. * 1024.;
        let mut reader_table = table!(
            [
                "estimated size",
                format!("{:.03} GiB", self.required_bytes as f64 / GIB)
            ],
            [
                "memory",
                format!("{:.03} GiB", self.total_memory as f64 / GIB)
            ],
            ["requested mode", self.ctx.options.mode],
            ["selected mode", self.mode],
            ["data column", &self.ctx.options.data_column],
            ["temp dir", self.ctx.options.temp_dir.display()]
        );
        reader_table.set_format(*prettyformat::consts::FORMAT_CLEAN);
        writeln!(f, "Reader:\n{}", reader_table)?;

        if self.ctx.flag_antennas.is_empty() {
            writeln!(f, "Will not write flags")?;
        } else {
            writeln!(
                f,
                "Will flag every baseline of antennas {:?}",
                self.ctx.flag_antennas
            )?;
        }
        Ok(())
    }
}

/// What a run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// The backend that was used
    pub mode: Option<ReadMode>,
    /// Baseline time series read
    pub baselines: usize,
    /// Samples read
    pub samples: usize,
    /// Samples that were already flagged
    pub flagged: usize,
    /// Baseline time series that were flagged because of their antennas
    pub flagged_baselines: usize,
}

/// Parsed command line of the `msreorder` binary.
#[derive(Debug, Clone)]
pub struct MsReorderContext {
    /// The measurement set to read
    pub input: PathBuf,
    /// Options for the reader
    pub options: ReaderOptions,
    /// Flag every baseline touching these antennas
    pub flag_antennas: Vec<usize>,
    /// Only print the summary
    pub dry_run: bool,
}

impl MsReorderContext {
    fn get_matches<I, T>(args: I) -> Result<clap::ArgMatches, MsReorderError>
    where
        I: IntoIterator<Item = T> + Debug,
        T: Into<OsString> + Clone,
    {
        let mut app = command!()
            .arg_required_else_help(true)
            .next_line_help(false)
            .about("Read a measurement set baseline by baseline, optionally flagging antennas.")
            .args(&[
                arg!(<MS> "Measurement set to read")
                    .value_hint(FilePath)
                    .required(true),
                arg!(--mode <MODE> "Backend used to serve baselines: direct, memory, reordering or auto")
                    .help_heading("READER")
                    .required(false),
                arg!(--"data-column" <NAME> "Visibility column to read")
                    .help_heading("READER")
                    .required(false),
                arg!(--"interval-start" <STEP> "First time step of each sequence to read")
                    .help_heading("READER")
                    .required(false),
                arg!(--"interval-end" <STEP> "One past the last time step of each sequence to read")
                    .help_heading("READER")
                    .required(false),
                arg!(--"temp-dir" <DIR> "Directory for reordered temporary files")
                    .value_hint(DirPath)
                    .help_heading("READER")
                    .required(false),
                arg!(--"keep-temp-files" "Leave the reordered temporary files behind")
                    .help_heading("READER"),
                arg!(--"memory-limit" <BYTES> "Memory budget, instead of the total system memory")
                    .help_heading("RESOURCE LIMITS")
                    .required(false),
                arg!(--"flag-antennas" <ANTS> "Flag every baseline of these antenna indices")
                    .help_heading("FLAGGING")
                    .multiple_values(true)
                    .required(false),
                arg!(--"no-draw-progress" "do not show progress bars"),
                arg!(--"dry-run" "Just print the summary and exit"),
            ]);
        let matches = app.try_get_matches_from_mut(args)?;
        Ok(matches)
    }

    fn optional<T>(matches: &clap::ArgMatches, name: &str) -> Result<Option<T>, MsReorderError>
    where
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: Display,
    {
        match matches.value_of_t::<T>(name) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == ArgumentNotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn parse_interval(matches: &clap::ArgMatches) -> Result<TimeInterval, MsReorderError> {
        let interval = TimeInterval {
            start: Self::optional(matches, "interval-start")?,
            end: Self::optional(matches, "interval-end")?,
        };
        if let (Some(start), Some(end)) = (interval.start, interval.end) {
            if start > end {
                return Err(InvalidCommandLineArgument {
                    option: "--interval-start <STEP> --interval-end <STEP>".into(),
                    expected: "start <= end".into(),
                    received: format!("start={} end={}", start, end),
                }
                .into());
            }
        }
        Ok(interval)
    }

    fn parse_options(matches: &clap::ArgMatches) -> Result<ReaderOptions, MsReorderError> {
        let mut builder = ReaderOptionsBuilder::default();
        builder
            .interval(Self::parse_interval(matches)?)
            .keep_temp_files(matches.is_present("keep-temp-files"))
            .draw_progress(!matches.is_present("no-draw-progress"));
        if let Some(mode) = Self::optional::<ReadMode>(matches, "mode")? {
            builder.mode(mode);
        }
        if let Some(column) = matches.value_of("data-column") {
            builder.data_column(column);
        }
        if let Some(dir) = matches.value_of("temp-dir") {
            builder.temp_dir(dir);
        }
        if let Some(limit) = Self::optional::<u64>(matches, "memory-limit")? {
            builder.memory_limit(limit);
        }
        Ok(builder.build().map_err(crate::error::CLIError::from)?)
    }

    /// Parse the command line.
    ///
    /// # Errors
    ///
    /// Can raise:
    /// - `clap::Error` if clap cannot parse `args`
    /// - `MsReorderError::CLIError` if the arguments are invalid.
    pub fn from_args<I, T>(args: I) -> Result<Self, MsReorderError>
    where
        I: IntoIterator<Item = T> + Debug,
        T: Into<OsString> + Clone,
    {
        debug!("args:\n{:?}", &args);

        let matches = Self::get_matches(args)?;
        trace!("arg matches:\n{:?}", &matches);

        let input = matches
            .value_of("MS")
            .map(PathBuf::from)
            .ok_or_else(|| MissingCommandLineArgument {
                option: "<MS>".into(),
            })?;
        let flag_antennas = match matches.values_of_t::<usize>("flag-antennas") {
            Ok(antennas) => antennas,
            Err(err) if err.kind() == ArgumentNotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            input,
            options: Self::parse_options(&matches)?,
            flag_antennas,
            dry_run: matches.is_present("dry-run"),
        })
    }

    /// Read every baseline of `table`, flagging the baselines of
    /// [`MsReorderContext::flag_antennas`].
    ///
    /// # Errors
    ///
    /// Can raise:
    /// - `MsReorderError::DryRun` after printing the summary, for a dry run
    /// - `MsReorderError::CLIError` if an antenna to flag doesn't exist
    /// - reader errors
    pub fn run_on<T: VisTable + 'static>(self, mut table: T) -> Result<RunStats, MsReorderError> {
        let mode = selector::select_mode(&mut table, &self.options)?;
        let required_bytes = selector::interval_data_size(&mut table, &self.options.interval)?;
        let meta = MsMetadata::new(&mut table, &self.options.interval)?;

        info!(
            "{}",
            Summary {
                ctx: &self,
                meta: &meta,
                mode,
                required_bytes,
                total_memory: selector::memory_budget(&self.options),
            }
        );

        if let Some(&bad) = self
            .flag_antennas
            .iter()
            .find(|&&a| a >= meta.antenna_count())
        {
            return Err(InvalidCommandLineArgument {
                option: "--flag-antennas <ANTS>...".into(),
                expected: format!("antenna indices < {}", meta.antenna_count()),
                received: format!("{}", bad),
            }
            .into());
        }
        if self.dry_run {
            return Err(DryRun {});
        }

        let keys: Vec<_> = meta.sequences().iter().map(|s| s.key).collect();
        let options = ReaderOptions { mode, ..self.options };
        let mut reader = selector::new_reader(table, options)?;
        reader.prepare()?;

        let mut stats = RunStats {
            mode: Some(reader.mode()),
            ..RunStats::default()
        };
        let batch_size = reader.max_recommended_buffer_size(1).max(1);
        for batch in keys.chunks(batch_size) {
            for key in batch {
                reader.add_read_request(key.antenna1, key.antenna2, key.band, key.sequence_id)?;
            }
            reader.perform_read_requests()?;
            for _ in batch {
                let result = reader.next_result()?;
                stats.baselines += 1;
                for flags in &result.flags {
                    stats.samples += flags.len();
                    stats.flagged += flags.iter().filter(|&&f| f).count();
                }
                let key = result.key;
                if self.flag_antennas.contains(&key.antenna1)
                    || self.flag_antennas.contains(&key.antenna2)
                {
                    let mask = Array2::from_elem((result.width(), result.channel_count()), true);
                    reader.add_flag_write_request(
                        FlagWriteRequest::new(key, vec![mask]).with_start(result.time_range.start),
                    )?;
                    stats.flagged_baselines += 1;
                }
            }
            reader.perform_flag_write_requests()?;
        }
        reader.close()?;

        info!(
            "read {} baselines, {} of {} samples were flagged{}",
            stats.baselines,
            stats.flagged,
            stats.samples,
            if stats.flagged_baselines > 0 {
                format!(", flagged {} baselines", stats.flagged_baselines)
            } else {
                "".into()
            }
        );
        Ok(stats)
    }
}

cfg_if! {
    if #[cfg(feature = "ms")] {
        impl MsReorderContext {
            /// Open the input measurement set and run on it.
            ///
            /// # Errors
            ///
            /// see [`MsReorderContext::run_on`]
            pub fn run(self) -> Result<RunStats, MsReorderError> {
                let table = MsTable::open(&self.input)?;
                self.run_on(table)
            }
        }
    } else {
        impl MsReorderContext {
            /// Measurement sets can't be opened without the `ms` feature.
            ///
            /// # Errors
            ///
            /// Always raises `CLIError::MissingFeature`.
            pub fn run(self) -> Result<RunStats, MsReorderError> {
                Err(crate::error::CLIError::MissingFeature {
                    what: format!("reading {}", self.input.display()),
                    feature: "ms",
                }
                .into())
            }
        }
    }
}

/// Run the `msreorder` binary with `args`, returning the exit code.
pub fn main_with_args<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T> + Debug,
    T: Into<OsString> + Clone,
{
    let ctx = match MsReorderContext::from_args(args) {
        Ok(ctx) => ctx,
        Err(ClapError(inner)) => {
            // Swallow broken pipe errors
            trace!("clap error: {:?}", inner.kind());
            let _ = inner.print();
            match inner.kind() {
                DisplayHelp | DisplayVersion => return 0,
                _ => return 1,
            }
        }
        Err(e) => {
            eprintln!("error parsing args: {e}");
            return 1;
        }
    };

    match ctx.run() {
        Ok(_) => 0,
        Err(DryRun {}) => {
            info!("Dry run. No files will be written.");
            0
        }
        Err(e) => {
            eprintln!("msreorder error: {e}");
            1
        }
    }
}
