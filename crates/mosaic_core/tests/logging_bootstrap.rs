use mosaic_core::{
    init_logging, logging_status, Kernel, KernelConfig, KernelError, LoggingConfig, LoggingError,
};

// Logger state is process-wide, so every step runs in one test.
#[test]
fn logging_initializes_once_and_rejects_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("logs");
    let log_dir_text = log_dir.to_string_lossy().into_owned();

    assert_eq!(logging_status(), None);
    assert!(matches!(
        init_logging(&LoggingConfig::new("info", "relative/logs")),
        Err(LoggingError::RelativeLogDir(_))
    ));
    assert_eq!(logging_status(), None);

    init_logging(&LoggingConfig::new("INFO", log_dir_text.clone())).unwrap();
    init_logging(&LoggingConfig::new("info", log_dir_text.clone())).unwrap();
    assert_eq!(logging_status(), Some(("info", log_dir.clone())));
    assert!(log_dir.is_dir());

    assert!(matches!(
        init_logging(&LoggingConfig::new("debug", log_dir_text.clone())),
        Err(LoggingError::LevelConflict {
            active: "info",
            requested: "debug"
        })
    ));
    let other_dir = dir.path().join("other");
    assert!(matches!(
        init_logging(&LoggingConfig::new(
            "info",
            other_dir.to_string_lossy().into_owned()
        )),
        Err(LoggingError::DirectoryConflict { .. })
    ));

    let config = KernelConfig {
        name: "logged".to_string(),
        logging: Some(LoggingConfig::new("info", log_dir_text)),
    };
    let kernel = Kernel::start(config).unwrap();
    kernel.shutdown();

    let conflicting = KernelConfig {
        name: "logged".to_string(),
        logging: Some(LoggingConfig::new("error", log_dir.to_string_lossy())),
    };
    assert!(matches!(
        Kernel::start(conflicting),
        Err(KernelError::Logging(LoggingError::LevelConflict { .. }))
    ));
    assert_eq!(logging_status(), Some(("info", log_dir)));
}
