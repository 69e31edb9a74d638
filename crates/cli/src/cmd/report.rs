use anyhow::{Context, Result};
use argp::FromArgs;
use scanrelay_core::models::ScannerKind;
use scanrelay_github::report::{ReportOptions, build_comment, build_conclusion};
use scanrelay_scanners::parse_artifact;
use typed_path::Utf8NativePathBuf;

use crate::util::{native_path, scanner_kind};

#[derive(FromArgs, PartialEq, Debug)]
/// Render a scanner results file into the pull request comment markdown.
#[argp(subcommand, name = "report")]
pub struct Args {
    #[argp(option, short = 's', from_str_fn(scanner_kind))]
    /// scanner that produced the results (kics, blackduck)
    scanner: ScannerKind,
    #[argp(option, short = 'i', from_str_fn(native_path))]
    /// scanner results file
    input: Utf8NativePathBuf,
    #[argp(option, short = 'o', from_str_fn(native_path))]
    /// write markdown comment to output file
    output: Option<Utf8NativePathBuf>,
}

pub fn run(args: &Args) -> Result<()> {
    let data = std::fs::read(args.input.with_platform_encoding())
        .with_context(|| format!("Failed to read {}", args.input))?;
    let result = parse_artifact(args.scanner, &data)
        .with_context(|| format!("Failed to parse {}", args.input))?;
    tracing::info!(
        "Parsed {} issues, conclusion: {}",
        result.total_issues,
        build_conclusion(&result)
    );
    let comment = build_comment(&result, &ReportOptions::new(args.scanner));
    if let Some(out_path) = &args.output {
        std::fs::write(out_path.with_platform_encoding(), comment)
            .with_context(|| format!("Failed to write output file '{}'", out_path))?;
    } else {
        println!("{}", comment);
    }
    Ok(())
}
