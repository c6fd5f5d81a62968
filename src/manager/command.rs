use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::Result;
use crate::process::{CommandSpec, ToolPaths};
use crate::records::{
    ConnectionInfo, DumpFormat, DumpOptions, DumpProgram, RestoreOptions, RestoreProgram,
};

/// Environment variables whose values never appear in persisted command
/// strings or logs.
const SECRET_ENV_VARS: [&str; 1] = ["PGPASSWORD"];

/// Connection parameters for the child process environment. The connection
/// URI is deliberately never placed in argv: argv is visible to every local
/// user via ps.
pub(crate) fn connection_env(
    con: &ConnectionInfo,
    db_override: Option<&str>,
) -> Vec<(String, String)> {
    let mut envs = vec![
        ("PGHOST".to_string(), con.host.clone()),
        ("PGPORT".to_string(), con.port.to_string()),
        (
            "PGDATABASE".to_string(),
            db_override.unwrap_or(&con.db_name).to_string(),
        ),
        ("PGUSER".to_string(), con.user.clone()),
        ("PGPASSWORD".to_string(), con.password.clone()),
    ];
    if let Some(ssl) = &con.ssl_mode {
        envs.push(("PGSSLMODE".to_string(), ssl.clone()));
    }
    envs
}

fn add_options(base: Vec<String>, extra: Vec<(bool, Vec<String>)>) -> Vec<String> {
    let mut out = base;
    for (enabled, values) in extra {
        if enabled {
            out.extend(values);
        }
    }
    out
}

fn flag(name: &str) -> Vec<String> {
    vec![name.to_string()]
}

fn flag_with(name: &str, value: impl ToString) -> Vec<String> {
    vec![name.to_string(), value.to_string()]
}

/// Builds the dump invocation. Deterministic: the same options always yield
/// the same argv, and credentials only ever ride in the environment.
pub(crate) fn build_dump_command(
    tools: &ToolPaths,
    con: &ConnectionInfo,
    o: &DumpOptions,
) -> Result<CommandSpec> {
    let program = tools.resolve(o.command.tool_name())?;
    let args = match o.command {
        DumpProgram::PgDumpAll => add_options(
            Vec::new(),
            vec![
                (o.clean, flag("--clean")),
                (o.if_exists, flag("--if-exists")),
                (o.globals_only, flag("--globals-only")),
                (o.roles_only, flag("--roles-only")),
                (o.data_only, flag("--data-only")),
                (o.schema_only, flag("--schema-only")),
                (
                    o.encoding.is_some(),
                    flag_with("--encoding", o.encoding.clone().unwrap_or_default()),
                ),
                (true, flag("-v")),
            ],
        ),
        DumpProgram::PgDump => add_options(
            Vec::new(),
            vec![
                (true, flag_with("--format", o.format.as_flag())),
                (o.clean, flag("--clean")),
                (o.create, flag("--create")),
                (o.no_owner, flag("--no-owner")),
                (o.if_exists, flag("--if-exists")),
                (o.data_only, flag("--data-only")),
                (o.schema_only, flag("--schema-only")),
                (
                    o.encoding.is_some(),
                    flag_with("--encoding", o.encoding.clone().unwrap_or_default()),
                ),
                (
                    o.compression_level.is_some(),
                    flag_with("--compress", o.compression_level.unwrap_or(0)),
                ),
                (
                    o.number_of_jobs.is_some(),
                    flag_with("--jobs", o.number_of_jobs.unwrap_or(1)),
                ),
                (true, flag("-v")),
            ],
        ),
    };

    Ok(CommandSpec {
        program,
        args,
        envs: connection_env(con, None),
    })
}

/// Builds the restore invocation. Plain dumps go through psql reading from
/// stdin; everything else goes through pg_restore pointed at `target_db`.
pub(crate) fn build_restore_command(
    tools: &ToolPaths,
    con: &ConnectionInfo,
    o: &RestoreOptions,
    target_db: &str,
) -> Result<CommandSpec> {
    let envs = connection_env(con, Some(target_db));
    let use_psql = matches!(o.command, RestoreProgram::Psql) || o.format == DumpFormat::Plain;

    if use_psql {
        return Ok(CommandSpec {
            program: tools.resolve(RestoreProgram::Psql.tool_name())?,
            args: vec![
                "-X".to_string(),
                "-q".to_string(),
                "-v".to_string(),
                "ON_ERROR_STOP=1".to_string(),
            ],
            envs,
        });
    }

    let args = add_options(
        vec![format!("--dbname={target_db}"), "-w".to_string()],
        vec![
            (o.clean, flag("--clean")),
            (o.create, flag("--create")),
            (o.no_owner, flag("--no-owner")),
            (true, flag_with("--format", o.format.as_flag())),
            (o.data_only, flag("--data-only")),
            (o.if_exists, flag("--if-exists")),
            (
                o.number_of_jobs.is_some(),
                flag_with("--jobs", o.number_of_jobs.unwrap_or(1)),
            ),
            (true, flag("-v")),
        ],
    );

    Ok(CommandSpec {
        program: tools.resolve(RestoreProgram::PgRestore.tool_name())?,
        args,
        envs,
    })
}

/// Invocation string for the record, with secret env values masked.
pub(crate) fn redacted_command_string(spec: &CommandSpec) -> String {
    let mut parts: Vec<String> = spec
        .envs
        .iter()
        .map(|(key, value)| {
            if SECRET_ENV_VARS.contains(&key.as_str()) {
                format!("{key}=[redacted]")
            } else {
                format!("{key}={value}")
            }
        })
        .collect();
    parts.push(spec.program.display().to_string());
    parts.extend(spec.args.iter().cloned());
    parts.join(" ")
}

pub(crate) fn dump_content_type(o: &DumpOptions) -> &'static str {
    if o.command == DumpProgram::PgDumpAll || o.format == DumpFormat::Plain {
        "text/sql"
    } else {
        "application/gzip"
    }
}

/// Object/record id: readable, sortable and unique.
pub(crate) fn backup_object_id(
    db_name: &str,
    created: DateTime<Utc>,
    o: &DumpOptions,
) -> String {
    let db: String = db_name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    let all = if o.command == DumpProgram::PgDumpAll { "all" } else { "" };
    let ext = if dump_content_type(o) == "text/sql" { "sql" } else { "dump" };
    format!(
        "{db}__{}_pg_dump{all}_{}.{ext}",
        created.format("%Y-%m-%dT%H_%M_%S"),
        Uuid::new_v4()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn con() -> ConnectionInfo {
        ConnectionInfo {
            id: "c1".into(),
            host: "db.internal".into(),
            port: 5432,
            db_name: "appdb".into(),
            user: "app".into(),
            password: "s3cret-pw".into(),
            ssl_mode: Some("require".into()),
            backup_keep_last: None,
        }
    }

    fn tools() -> ToolPaths {
        ToolPaths::in_dir("/usr/lib/postgresql/bin")
    }

    fn all_dump_option_combos() -> Vec<DumpOptions> {
        let mut combos = Vec::new();
        for command in [DumpProgram::PgDump, DumpProgram::PgDumpAll] {
            for format in [DumpFormat::Plain, DumpFormat::Custom, DumpFormat::Tar] {
                for clean in [false, true] {
                    for if_exists in [false, true] {
                        combos.push(DumpOptions {
                            command,
                            format,
                            clean,
                            if_exists,
                            create: clean,
                            no_owner: if_exists,
                            encoding: clean.then(|| "UTF8".to_string()),
                            compression_level: if_exists.then_some(6),
                            number_of_jobs: clean.then_some(4),
                            ..DumpOptions::default()
                        });
                    }
                }
            }
        }
        combos
    }

    #[test]
    fn password_never_reaches_argv_or_command_string() -> anyhow::Result<()> {
        for options in all_dump_option_combos() {
            let spec = build_dump_command(&tools(), &con(), &options)?;
            for arg in &spec.args {
                assert!(!arg.contains("s3cret-pw"), "password leaked into argv: {arg}");
            }
            let rendered = redacted_command_string(&spec);
            assert!(!rendered.contains("s3cret-pw"), "password leaked into: {rendered}");
            assert!(rendered.contains("PGPASSWORD=[redacted]"));
            // The password still travels, via the environment only.
            assert!(spec
                .envs
                .iter()
                .any(|(k, v)| k == "PGPASSWORD" && v == "s3cret-pw"));
        }
        Ok(())
    }

    #[test]
    fn dump_argv_follows_options() -> anyhow::Result<()> {
        let spec = build_dump_command(
            &tools(),
            &con(),
            &DumpOptions {
                command: DumpProgram::PgDump,
                format: DumpFormat::Custom,
                clean: true,
                if_exists: true,
                compression_level: Some(9),
                ..DumpOptions::default()
            },
        )?;
        assert_eq!(spec.program, PathBuf::from("/usr/lib/postgresql/bin/pg_dump"));
        let args = spec.args.join(" ");
        assert!(args.contains("--format custom"));
        assert!(args.contains("--clean"));
        assert!(args.contains("--if-exists"));
        assert!(args.contains("--compress 9"));
        assert!(args.ends_with("-v"));
        assert!(!args.contains("--create"));
        Ok(())
    }

    #[test]
    fn dumpall_has_no_format_flag() -> anyhow::Result<()> {
        let spec = build_dump_command(
            &tools(),
            &con(),
            &DumpOptions {
                command: DumpProgram::PgDumpAll,
                globals_only: true,
                ..DumpOptions::default()
            },
        )?;
        assert!(spec.program.ends_with("pg_dumpall"));
        assert!(!spec.args.iter().any(|a| a == "--format"));
        assert!(spec.args.iter().any(|a| a == "--globals-only"));
        Ok(())
    }

    #[test]
    fn plain_format_restores_through_psql() -> anyhow::Result<()> {
        let spec = build_restore_command(
            &tools(),
            &con(),
            &RestoreOptions {
                command: RestoreProgram::PgRestore,
                format: DumpFormat::Plain,
                ..RestoreOptions::default()
            },
            "appdb",
        )?;
        assert!(spec.program.ends_with("psql"));
        assert!(spec.args.contains(&"ON_ERROR_STOP=1".to_string()));
        Ok(())
    }

    #[test]
    fn pg_restore_targets_database_from_env_value() -> anyhow::Result<()> {
        let spec = build_restore_command(
            &tools(),
            &con(),
            &RestoreOptions {
                clean: true,
                if_exists: true,
                ..RestoreOptions::default()
            },
            "appdb_copy",
        )?;
        assert!(spec.program.ends_with("pg_restore"));
        assert!(spec.args.contains(&"--dbname=appdb_copy".to_string()));
        assert!(spec.args.contains(&"-w".to_string()));
        assert!(spec
            .envs
            .iter()
            .any(|(k, v)| k == "PGDATABASE" && v == "appdb_copy"));
        assert!(!spec.args.iter().any(|a| a.contains("s3cret-pw")));
        Ok(())
    }

    #[test]
    fn content_type_tracks_format() {
        let plain = DumpOptions {
            format: DumpFormat::Plain,
            ..DumpOptions::default()
        };
        assert_eq!(dump_content_type(&plain), "text/sql");
        assert_eq!(dump_content_type(&DumpOptions::default()), "application/gzip");
    }

    #[test]
    fn object_ids_are_flattened_and_unique() {
        let created = Utc::now();
        let options = DumpOptions::default();
        let a = backup_object_id("my db/prod", created, &options);
        let b = backup_object_id("my db/prod", created, &options);
        assert!(a.starts_with("my_db_prod__"));
        assert!(a.ends_with(".dump"));
        assert_ne!(a, b);
    }
}
