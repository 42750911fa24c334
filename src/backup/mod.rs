mod service;

pub use service::{
  parse_backup_filename, BackupDescriptor, BackupFormat, BackupOptions, BackupService,
  RestoreOptions,
};
