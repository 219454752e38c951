use std::{
    fs::File,
    io::{BufWriter, Write},
    time::Instant,
};

use anyhow::{Result, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde::Serialize;
use sysheap_bin::{create_heap, init_logging_with_progress, load_phys_mem};
use sysheap_core::memory::Vma;
use sysheap_core::util::{Size, page_align};
use sysheap_core::{Buffer, Heap, HeapType};

/// CLI arguments for the `eval_heap` binary.
#[derive(Debug, Parser, Serialize, Clone)]
struct CliArgs {
    /// Physical arena config file. Overrides the zone sizes below.
    #[clap(long = "config")]
    config: Option<String>,
    /// Low memory zone size in MB.
    #[clap(long = "lowmem", default_value = "16")]
    lowmem_mb: usize,
    /// High memory zone size in MB.
    #[clap(long = "highmem", default_value = "16")]
    highmem_mb: usize,
    /// The heap to evaluate (`system` or `contig`).
    #[clap(long = "heap", default_value = "system")]
    heap: String,
    /// The number of allocation attempts to perform.
    #[clap(long = "attempts", default_value = "10")]
    attempts: u32,
    /// The buffer size in bytes.
    #[clap(long = "size", default_value = "65536")]
    size: usize,
    /// Output file for results (JSON format).
    #[clap(long = "output")]
    output: Option<String>,
    /// Verbose output - print the scatter-gather table of every buffer.
    #[clap(long = "verbose", short = 'v')]
    verbose: bool,
    /// Keep buffers allocated until all attempts are done.
    #[clap(long = "keep")]
    keep: bool,
}

#[derive(Debug, Serialize, Clone)]
struct AttemptResult {
    attempt: u32,
    success: bool,
    duration_us: u64,
    segments: Option<usize>,
    mapped_len: Option<usize>,
    segment_dump: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct EvaluationResults {
    args: CliArgs,
    heap_type: HeapType,
    total_attempts: u32,
    successful_attempts: u32,
    failed_attempts: u32,
    success_rate: f64,
    average_duration_us: f64,
    leaked_pages: usize,
    attempts: Vec<AttemptResult>,
}

impl EvaluationResults {
    fn new(args: CliArgs, heap_type: HeapType) -> Self {
        Self {
            args,
            heap_type,
            total_attempts: 0,
            successful_attempts: 0,
            failed_attempts: 0,
            success_rate: 0.0,
            average_duration_us: 0.0,
            leaked_pages: 0,
            attempts: Vec::new(),
        }
    }

    fn add_attempt(&mut self, result: AttemptResult) {
        self.total_attempts += 1;
        if result.success {
            self.successful_attempts += 1;
        } else {
            self.failed_attempts += 1;
        }
        let total_us: u64 = self.attempts.iter().map(|a| a.duration_us).sum::<u64>()
            + result.duration_us;
        self.attempts.push(result);

        self.success_rate = self.successful_attempts as f64 / self.total_attempts as f64;
        self.average_duration_us = total_us as f64 / self.total_attempts as f64;
    }

    fn save_to_file(&self, filename: &str) -> Result<()> {
        let file = File::create(filename)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        info!("Results saved to {}", filename);
        Ok(())
    }
}

fn pattern(i: usize) -> u8 {
    (i % 251) as u8
}

/// Run one allocate/map/verify cycle. The buffer is handed back so the
/// caller decides when it is freed.
fn exercise(heap: &Heap, args: &CliArgs) -> Result<(Buffer, usize, usize, String)> {
    let mut buffer = heap.allocate(args.size, 0, 0)?;
    let (segments, dump) = match heap.map_dma(&mut buffer) {
        Ok(table) => (table.nents(), table.format_segments()),
        Err(e) => {
            heap.free(buffer);
            return Err(e.into());
        }
    };

    if let Err(e) = heap.map_kernel(&mut buffer) {
        heap.free(buffer);
        return Err(e.into());
    }
    let mapped_len = match buffer.vaddr_mut() {
        Some(mapping) => {
            for (i, byte) in mapping.as_mut_slice().iter_mut().enumerate() {
                *byte = pattern(i);
            }
            mapping.len()
        }
        None => 0,
    };

    let verified = page_align(args.size)
        .ok_or_else(|| anyhow::anyhow!("size overflows"))
        .and_then(|len| Ok(Vma::reserve(len, 0)?))
        .and_then(|mut vma| {
            heap.map_user(&buffer, &mut vma)?;
            // SAFETY: the region was populated by map_user above
            let user = unsafe { vma.as_slice() };
            Ok(user[..mapped_len]
                .iter()
                .enumerate()
                .all(|(i, b)| *b == pattern(i)))
        });
    match verified {
        Ok(true) => {}
        Ok(false) => {
            heap.free(buffer);
            bail!("user mapping does not match kernel mapping");
        }
        Err(e) => {
            heap.free(buffer);
            return Err(e);
        }
    }

    Ok((buffer, segments, mapped_len, dump))
}

fn evaluate_heap(args: &CliArgs) -> Result<EvaluationResults> {
    let progress = init_logging_with_progress()?;
    let mem = load_phys_mem(
        args.config.as_deref(),
        Size::MB(args.lowmem_mb),
        Size::MB(args.highmem_mb),
    )?;
    let heap = create_heap(&args.heap, mem.clone())?;

    info!("Starting heap evaluation with {} attempts", args.attempts);
    info!("Heap: {}, buffer size: {}", heap.heap_type(), Size::B(args.size));

    let mut results = EvaluationResults::new(args.clone(), heap.heap_type());
    let mut kept = vec![];

    let bar = progress.add(ProgressBar::new(args.attempts as u64));
    bar.set_style(
        ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len}")?.progress_chars("=> "),
    );
    bar.set_message(format!("{} heap", heap.heap_type()));

    for attempt in 1..=args.attempts {
        let start_time = Instant::now();
        let result = match exercise(&heap, args) {
            Ok((buffer, segments, mapped_len, dump)) => {
                let duration = start_time.elapsed();
                if args.verbose {
                    info!(
                        "Attempt {}: {} segments, {} bytes mapped in {}us",
                        attempt,
                        segments,
                        mapped_len,
                        duration.as_micros()
                    );
                    info!("  Segments:\n{}", dump);
                }
                if args.keep {
                    kept.push(buffer);
                } else {
                    heap.free(buffer);
                }
                AttemptResult {
                    attempt,
                    success: true,
                    duration_us: duration.as_micros() as u64,
                    segments: Some(segments),
                    mapped_len: Some(mapped_len),
                    segment_dump: args.verbose.then_some(dump),
                    error: None,
                }
            }
            Err(e) => {
                let duration = start_time.elapsed();
                warn!("Attempt {}: failed - {}", attempt, e);
                AttemptResult {
                    attempt,
                    success: false,
                    duration_us: duration.as_micros() as u64,
                    segments: None,
                    mapped_len: None,
                    segment_dump: None,
                    error: Some(format!("{:?}", e)),
                }
            }
        };
        results.add_attempt(result);
        bar.inc(1);
    }
    bar.finish();

    if !kept.is_empty() {
        info!("Freeing {} kept buffers", kept.len());
    }
    for buffer in kept {
        heap.free(buffer);
    }
    results.leaked_pages = mem.allocated_pages();
    if results.leaked_pages != 0 {
        warn!("{} pages still allocated after teardown", results.leaked_pages);
    }
    heap.destroy();

    Ok(results)
}

fn main() -> Result<()> {
    let args = CliArgs::parse();
    let results = evaluate_heap(&args)?;
    info!("CLI args: {:?}", args);

    if let Some(output_file) = &args.output {
        results.save_to_file(output_file)?;
    }

    info!("=== EVALUATION SUMMARY ===");
    info!("Success rate: {:.2}%", results.success_rate * 100.0);
    info!("Average duration: {:.2}us", results.average_duration_us);
    info!(
        "Successful attempts: {}/{}",
        results.successful_attempts, results.total_attempts
    );
    Ok(())
}
