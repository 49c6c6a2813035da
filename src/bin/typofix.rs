use std::io::{self, BufRead, Write};

use typing_corrector::backend::CandleLoader;
use typing_corrector::telemetry::init_tracing;
use typing_corrector::{CorrectionEngine, EngineConfig};

fn main() -> anyhow::Result<()> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let (Some(model), Some(vocab)) = (args.next(), args.next()) else {
        eprintln!("usage: typofix <model.gguf> <vocab.json|tokenizer.json> [config.toml]");
        std::process::exit(2);
    };
    let config = match args.next() {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    let family = config.family;
    let engine = CorrectionEngine::new(config, CandleLoader { family })?;
    engine.initialize_from_paths(&model, &vocab)?;

    println!("typofix {} ready, one line per correction (Ctrl-D to quit)", typing_corrector::VERSION);

    let mut out = io::stdout().lock();
    for line in io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match engine.correct(&line) {
            Ok(result) => writeln!(out, "{}", result.text)?,
            Err(e) => eprintln!("correction failed: {}", e),
        }
        out.flush()?;
    }

    Ok(())
}
