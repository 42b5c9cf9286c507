use clap::Parser;
use fedsql::config::EngineConfig;
use fedsql::datasource::DataSourceManager;
use fedsql::error::EngineError;
use fedsql::processor::{Execution, QueryProcessor};
use fedsql::{Args, SharedCatalog, Translation};
use std::error::Error as StdError;
use std::sync::Arc;

fn main() {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };
    let code = runtime.block_on(async_main());
    runtime.shutdown_timeout(std::time::Duration::from_secs(2));
    std::process::exit(code);
}

async fn async_main() -> i32 {
    let args = Args::parse();

    if args.translate {
        return run_translate(&args);
    }

    match run_execute(&args).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(err.as_ref());
            1
        }
    }
}

fn run_translate(args: &Args) -> i32 {
    let (Some(from), Some(to)) = (args.from, args.to) else {
        eprintln!("--translate requires --from and --to");
        return 1;
    };
    let Some(sql) = args.sql.as_deref().or(args.command.as_deref()) else {
        eprintln!("--translate requires a SQL statement");
        return 1;
    };
    // Offline mode: no catalog, unresolved identifiers are reported.
    match fedsql::translate(sql, from, to, None) {
        Ok(Translation { sql, unresolved }) => {
            println!("{sql}");
            if !unresolved.is_empty() {
                eprintln!("unresolved identifiers: {}", unresolved.join(", "));
            }
            0
        }
        Err(err) => {
            report_engine_error(&err);
            1
        }
    }
}

async fn run_execute(args: &Args) -> Result<(), Box<dyn StdError>> {
    let config = EngineConfig::load(&args.config)?;
    fedsql::logging::init(config.props.log_level);

    let manager = Arc::new(DataSourceManager::from_config(&config).await?);
    let catalog = SharedCatalog::new(manager.discover_catalog().await?);
    manager.start_health_checks();
    let processor = QueryProcessor::new(catalog, manager.clone(), config.props.clone());

    let statements: Vec<String> = if let Some(path) = &args.file {
        let script = std::fs::read_to_string(path)?;
        fedsql::parser::split_statements(&script)
    } else if let Some(sql) = args.command.as_deref().or(args.sql.as_deref()) {
        vec![sql.to_string()]
    } else {
        return Err("no statement provided; pass SQL, -c, or -f <file>".into());
    };

    let mut result: Result<(), Box<dyn StdError>> = Ok(());
    for sql in statements {
        match processor.execute(&sql, None).await {
            Ok(execution) => print_execution(execution).await?,
            Err(err) => {
                result = Err(Box::new(err));
                break;
            }
        }
    }

    manager.shutdown().await;
    result
}

async fn print_execution(execution: Execution) -> Result<(), Box<dyn StdError>> {
    match execution {
        Execution::Rows {
            schema, mut stream, ..
        } => {
            let header: Vec<&str> = schema.fields.iter().map(|f| f.name.as_str()).collect();
            println!("{}", header.join("\t"));
            loop {
                let frame = stream.next_frame(0).await?;
                for row in &frame.rows {
                    let rendered: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                    println!("{}", rendered.join("\t"));
                }
                if frame.done {
                    if let Some(warning) = frame.warning {
                        eprintln!("warning: {warning}");
                    }
                    break;
                }
            }
        }
        Execution::UpdateCount { count, .. } => println!("OK, {count} row(s) affected"),
        Execution::Explain { plan, .. } => print!("{plan}"),
    }
    Ok(())
}

fn report_error(err: &dyn StdError) {
    if let Some(engine_err) = err.downcast_ref::<EngineError>() {
        report_engine_error(engine_err);
    } else {
        eprintln!("error: {err}");
    }
}

fn report_engine_error(err: &EngineError) {
    eprintln!(
        "error {} ({}): {}",
        err.code(),
        err.sql_state(),
        fedsql::sanitize::sanitize_text(&err.to_string())
    );
    if let EngineError::Syntax {
        snippet,
        suggestion,
        ..
    } = err
    {
        eprintln!("{snippet}");
        if let Some(keyword) = suggestion {
            eprintln!("hint: did you mean {keyword}?");
        }
    }
}
