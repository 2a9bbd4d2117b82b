use daygrid::{
    app_config_from_env, init_logging, log_app_start, log_run_summary, logging_config_from_env,
    run_to_sink, CsvTableSink, SqliteReadingStore,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let app_cfg = app_config_from_env()?;
    log_app_start(&logging_cfg, &app_cfg);

    let store = SqliteReadingStore::open_existing(&app_cfg.store_path)?;
    let mut sink = CsvTableSink::new(&app_cfg.output_path);
    let report = run_to_sink(&store, &mut sink, &app_cfg.pipeline)?;

    log_run_summary(sink.path(), &report);
    Ok(())
}
