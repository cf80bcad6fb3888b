use indexmap::IndexMap;
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crate::cab::{RuntimeStatus, shell_quote};
use crate::errors::{Result, cab_runtime_error};
use crate::progress::{cancellation_requested, log_progress};
use crate::runlog::{RunLog, Severity};

/// Resource-limit updates applied to child processes (opts.backend.rlimits).
pub fn rlimit_resource(name: &str) -> Option<libc::c_int> {
    match name {
        "cpu" => Some(libc::RLIMIT_CPU as libc::c_int),
        "as" | "mem" => Some(libc::RLIMIT_AS as libc::c_int),
        "nofile" => Some(libc::RLIMIT_NOFILE as libc::c_int),
        "core" => Some(libc::RLIMIT_CORE as libc::c_int),
        "fsize" => Some(libc::RLIMIT_FSIZE as libc::c_int),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamName {
    Stdout,
    Stderr,
}

/// Runs a subprocess, draining its stdout/stderr through reader threads.
/// Every line passes through the status object's wrangler chain before being
/// logged; wranglers may suppress lines, escalate severity, or mutate the
/// run status. Ctrl+C escalates SIGINT -> SIGTERM -> SIGKILL on a retry
/// budget. Returns the exit code.
pub fn xrun(
    args: &[String],
    command_name: &str,
    log: &RunLog,
    status: &mut RuntimeStatus,
    env: &IndexMap<String, String>,
    rlimits: &IndexMap<String, u64>,
    log_command: bool,
) -> Result<i32> {
    if args.is_empty() {
        return Err(cab_runtime_error("empty command line"));
    }
    if log_command {
        let quoted: Vec<String> = args.iter().map(|a| shell_quote(a)).collect();
        log.info(format!("running {}", quoted.join(" ")));
    }

    let mut command = Command::new(&args[0]);
    command
        .args(&args[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in env {
        command.env(key, value);
    }
    apply_rlimits(&mut command, rlimits);

    let mut child = command
        .spawn()
        .map_err(|exc| cab_runtime_error(format!("error running {command_name}: {exc}")))?;

    let (tx, rx) = mpsc::channel::<(StreamName, String)>();

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut readers = Vec::new();
    if let Some(stdout) = stdout {
        let tx = tx.clone();
        readers.push(thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                if tx.send((StreamName::Stdout, line)).is_err() {
                    break;
                }
            }
        }));
    }
    if let Some(stderr) = stderr {
        let tx = tx.clone();
        readers.push(thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                if tx.send((StreamName::Stderr, line)).is_err() {
                    break;
                }
            }
        }));
    }
    drop(tx);

    let started = Instant::now();
    let mut cancelled = false;
    let mut streams_open = true;

    while streams_open {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok((stream, line)) => {
                dispatch_line(log, status, command_name, stream, &line);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                streams_open = false;
            }
        }
        if !cancelled && cancellation_requested() {
            cancelled = true;
            log.warning(format!(
                "interrupting {command_name} process {}, please give it a few moments",
                child.id()
            ));
            shutdown_child(&mut child, command_name, log);
            // drain whatever the readers still have
            while let Ok((stream, line)) = rx.recv_timeout(Duration::from_millis(100)) {
                dispatch_line(log, status, command_name, stream, &line);
            }
            for reader in readers {
                let _ = reader.join();
            }
            return Err(cab_runtime_error(format!(
                "{command_name} interrupted ({})",
                crate::progress::cancellation_reason()
            )));
        }
    }

    for reader in readers {
        let _ = reader.join();
    }
    let exit = child
        .wait()
        .map_err(|exc| cab_runtime_error(format!("error waiting for {command_name}: {exc}")))?;
    let code = exit.code().unwrap_or(-1);
    log_progress(format!(
        "phase=cab-run status=finished command={command_name} exit={code} elapsed={:.1}s",
        started.elapsed().as_secs_f64()
    ));
    Ok(code)
}

fn dispatch_line(
    log: &RunLog,
    status: &mut RuntimeStatus,
    command_name: &str,
    stream: StreamName,
    line: &str,
) {
    let base = Severity::Info;
    let (line, severity) = status.apply_wranglers_to_line(line, base);
    if let Some(line) = line {
        let tag = match stream {
            StreamName::Stdout => "",
            StreamName::Stderr => " [stderr]",
        };
        log.log(severity, format!("{command_name}{tag}: {line}"));
    }
}

fn apply_rlimits(command: &mut Command, rlimits: &IndexMap<String, u64>) {
    use std::os::unix::process::CommandExt;
    let limits: Vec<(libc::c_int, u64)> = rlimits
        .iter()
        .filter_map(|(name, value)| rlimit_resource(name).map(|res| (res, *value)))
        .collect();
    if limits.is_empty() {
        return;
    }
    unsafe {
        command.pre_exec(move || {
            for (resource, value) in &limits {
                let limit = libc::rlimit { rlim_cur: *value, rlim_max: *value };
                if libc::setrlimit(*resource as libc::__rlimit_resource_t, &limit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
}

/// SIGINT first; SIGTERM after a few seconds; SIGKILL as a last resort.
fn shutdown_child(child: &mut Child, command_name: &str, log: &RunLog) {
    let pid = child.id() as libc::pid_t;
    unsafe {
        libc::kill(pid, libc::SIGINT);
    }
    for retry in 0..10 {
        match child.try_wait() {
            Ok(Some(exit)) => {
                log.info(format!(
                    "the {command_name} process exited with {}",
                    exit.code().unwrap_or(-1)
                ));
                return;
            }
            Ok(None) => {
                if retry == 4 {
                    log.warning(format!("terminating process {pid}"));
                    unsafe {
                        libc::kill(pid, libc::SIGTERM);
                    }
                }
                thread::sleep(Duration::from_millis(500));
            }
            Err(_) => break,
        }
    }
    log.warning(format!("killing process {pid}"));
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wranglers::create_list;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn captures_exit_code() {
        let log = RunLog::new("test");
        let mut status = RuntimeStatus::new(Vec::new());
        let code = xrun(
            &sh("exit 3"),
            "test",
            &log,
            &mut status,
            &IndexMap::new(),
            &IndexMap::new(),
            false,
        )
        .unwrap();
        assert_eq!(code, 3);
    }

    #[test]
    fn wranglers_see_output_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log =
            RunLog::with_file("test", dir.path(), "{fqname}.log", Severity::Info).unwrap();
        let wrangler = create_list(
            r"^### YIELDING CAB OUTPUT ## (.*)$",
            &["PARSE_JSON_OUTPUT_DICT".to_string(), "SUPPRESS".to_string()],
        )
        .unwrap();
        let mut status = RuntimeStatus::new(vec![wrangler]);
        let code = xrun(
            &sh(r#"echo 'hello'; echo '### YIELDING CAB OUTPUT ## {"n": 3}'"#),
            "test",
            &log,
            &mut status,
            &IndexMap::new(),
            &IndexMap::new(),
            false,
        )
        .unwrap();
        assert_eq!(code, 0);
        assert_eq!(status.outputs()["n"], crate::basetypes::PValue::Int(3));
        let content = std::fs::read_to_string(dir.path().join("test.log")).unwrap();
        assert!(content.contains("hello"));
        // the sentinel line was suppressed from the log
        assert!(!content.contains("YIELDING"));
    }

    #[test]
    fn declared_error_marks_failure() {
        let log = RunLog::new("test");
        let wrangler = create_list("^boom$", &["ERROR:it broke".to_string()]).unwrap();
        let mut status = RuntimeStatus::new(vec![wrangler]);
        let code = xrun(
            &sh("echo boom"),
            "test",
            &log,
            &mut status,
            &IndexMap::new(),
            &IndexMap::new(),
            false,
        )
        .unwrap();
        assert_eq!(code, 0);
        assert_eq!(status.success(), Some(false));
    }

    #[test]
    fn environment_is_passed() {
        let dir = tempfile::tempdir().unwrap();
        let log =
            RunLog::with_file("test", dir.path(), "{fqname}.log", Severity::Info).unwrap();
        let mut status = RuntimeStatus::new(Vec::new());
        let mut env = IndexMap::new();
        env.insert("STIMELA_TEST_VAR".to_string(), "marker-value".to_string());
        xrun(
            &sh("echo var=$STIMELA_TEST_VAR"),
            "test",
            &log,
            &mut status,
            &env,
            &IndexMap::new(),
            false,
        )
        .unwrap();
        let content = std::fs::read_to_string(dir.path().join("test.log")).unwrap();
        assert!(content.contains("var=marker-value"));
    }
}
