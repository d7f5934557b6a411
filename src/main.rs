// src/main.rs
// Command-line front end for Chargescan

use std::env;
use std::process;

use chargescan::tracing_init::init_tracing;
use chargescan::{AnalysisConfig, FormatRegistry, OutputMode, ParseOutput, ScanHeader, SignalBundle, CHANNELS};

fn print_usage() {
    eprintln!("Usage: chargescan <command> <scan_file> [options] [format]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  info <file> [format]                   Display scan header");
    eprintln!("  entry <file> [format]                  Print the flat entry record");
    eprintln!("  calib <file> [format]                  Print pedestal and gain per channel");
    eprintln!("  peaks <file> [format]                  Print fitted peak per step and channel");
    eprintln!("  dump <file> <step> <channel> [format]  Print mean and sigma per sample");
    eprintln!();
    eprintln!("Formats: v1, v2, auto (default)");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  chargescan info scan.txt v1");
    eprintln!("  chargescan calib scan.txt");
    eprintln!("  chargescan dump scan.txt 4 11 > step4_ch11.txt");
}

fn fail(message: String) -> ! {
    eprintln!("Error: {}", message);
    process::exit(1);
}

fn parse_index(text: &str, what: &str) -> usize {
    match text.parse() {
        Ok(n) => n,
        Err(_) => fail(format!("Invalid {} '{}'", what, text)),
    }
}

fn main() {
    init_tracing();

    let args: Vec<String> = env::args().collect();

    if args.len() < 3 {
        print_usage();
        process::exit(1);
    }

    let command = &args[1];
    let input_file = &args[2];

    let registry = match FormatRegistry::standard() {
        Ok(r) => r,
        Err(e) => fail(e.to_string()),
    };
    let config = AnalysisConfig::default();

    let format_at = |i: usize| args.get(i).map(String::as_str).unwrap_or("auto");

    let run_signal = |format: &str| -> SignalBundle {
        match registry.parse(format, input_file, OutputMode::Signal, &config) {
            Ok(ParseOutput::Signal(bundle)) => bundle,
            Ok(_) => fail("unexpected parse output".to_string()),
            Err(e) => fail(format!("Could not process scan '{}': {}", input_file, e)),
        }
    };

    match command.as_str() {
        "info" => match registry.read_header(format_at(3), input_file) {
            Ok(header) => print_header(input_file, format_at(3), &header),
            Err(e) => fail(format!("Could not read header of '{}': {}", input_file, e)),
        },

        "entry" => match registry.parse(format_at(3), input_file, OutputMode::Entry, &config) {
            Ok(ParseOutput::Entry(entry)) => print!("{}", entry),
            Ok(_) => fail("unexpected parse output".to_string()),
            Err(e) => fail(format!("Could not process scan '{}': {}", input_file, e)),
        },

        "calib" => {
            let bundle = run_signal(format_at(3));
            println!("# channel, pedestal, pedestal_err, gain, gain_err");
            for (channel, c) in bundle.calibration.channels.iter().enumerate() {
                println!(
                    "{:2}, {:.3}, {:.3e}, {:.4}, {:.3e}",
                    channel, c.pedestal, c.pedestal_err, c.gain, c.gain_err
                );
            }
        }

        "peaks" => {
            let bundle = run_signal(format_at(3));
            let header: Vec<String> = (0..CHANNELS).map(|c| format!("ch{}", c)).collect();
            println!("# step, {}", header.join(", "));
            for step in 0..bundle.peaks.n_steps {
                let row: Vec<String> = (0..CHANNELS)
                    .map(|c| format!("{:.2}", bundle.peaks.get(c, step).unwrap_or(0.0)))
                    .collect();
                println!("{}, {}", step, row.join(", "));
            }
        }

        "dump" => {
            if args.len() < 5 {
                eprintln!("Error: Missing step or channel argument");
                print_usage();
                process::exit(1);
            }
            let step = parse_index(&args[3], "step");
            let channel = parse_index(&args[4], "channel");
            let bundle = run_signal(format_at(5));

            match (bundle.signal.mean(channel, step), bundle.signal.sigma(channel, step)) {
                (Some(mean), Some(sigma)) => {
                    println!("# Step {} channel {} from {}", step, channel, input_file);
                    println!("# sample, mean, sigma");
                    for (i, (m, s)) in mean.iter().zip(sigma).enumerate() {
                        println!("{}, {:.4}, {:.4}", i, m, s);
                    }
                }
                _ => fail(format!(
                    "Step {} channel {} not found (scan has {} steps, {} channels)",
                    step, channel, bundle.signal.n_steps, CHANNELS
                )),
            }
        }

        _ => {
            eprintln!("Error: Unknown command '{}'", command);
            print_usage();
            process::exit(1);
        }
    }
}

fn print_header(input_file: &str, format: &str, header: &ScanHeader) {
    let geometry = &header.geometry;

    println!("Scan File Information");
    println!("=====================");
    println!();
    println!("File: {}", input_file);
    println!("Format: {}", format);
    println!();

    println!("Geometry:");
    println!("  Channel offset: {} (group {})", geometry.offset, geometry.group());
    println!("  Steps: {}", geometry.n_steps);
    println!("  Trials per step: {}", geometry.n_trials);
    println!("  Samples per waveform: {}", geometry.n_samples);
    println!("  Lines skipped per record: {} before, {} after", geometry.front_skip(), geometry.back_skip());
    println!();

    println!("Header fields:");
    for (key, value) in &geometry.version_fields {
        println!("  {}: {}", key, value);
    }
}
