//! Trace persistence
//!
//! Line-oriented ASCII format, one event per line, comma-separated
//! fields, discriminated by the first field:
//!
//! ```text
//! G,tpost,new_id,file:line                                     spawn
//! E,tpost                                                      routine exit
//! N,tpost,id,NC,qsize,file:line                                channel new
//! C,tpre,tpost,id,{S|R|C},{t|f},op_id,qsize,qcount,file:line   channel op
//! M,tpre,tpost,id,{t|f},{L|U|T|R|N|Y},{t|f},file:line          mutex op
//! W,tpre,tpost,id,{A|W},delta,val,file:line                    wait group
//! S,tpre,tpost,id,case~case~...[~{d|D}],sel_index,file:line    select
//! O,tpre,tpost,id,{t|f},file:line                              once
//! D,tpre,tpost,id,{W|S|B},file:line                            cond
//! A,timer,addr_hash,{L|S|A|W|C|M|O},file:line                  atomic
//! X,tpost,exit_code                                            replay marker
//! ```
//!
//! Select cases use the channel layout without the leading `C,`; a
//! trailing `d` marks a present default case, `D` a chosen one. A trace
//! directory holds one `trace_<routine>.log` per routine plus a
//! `trace_info.log` summary. Any malformed line is rejected with an
//! error naming line number and field.

use std::fs;
use std::io::Write;
use std::path::Path;

use thiserror::Error;

use crate::error::{WeftError, WeftResult};
use crate::trace::event::{
    AtomicOpKind, ChannelOpKind, CondOpKind, Event, EventKind, MutexOpKind, Position, RoutineId,
    SelectCase, WaitGroupOpKind,
};
use crate::trace::model::Trace;

/// Prefix of per-routine trace files
pub const TRACE_FILE_PREFIX: &str = "trace_";
/// Name of the per-directory summary file
pub const TRACE_INFO_FILE: &str = "trace_info.log";

/// Errors produced while parsing a trace file
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {line}: unknown event kind '{kind}'")]
    UnknownKind { line: usize, kind: String },

    #[error("line {line}: expected {expected} fields for '{kind}', got {got}")]
    FieldCount {
        line: usize,
        kind: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("line {line}, field '{field}': {message}")]
    Field {
        line: usize,
        field: &'static str,
        message: String,
    },

    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },
}

impl ParseError {
    fn field(line: usize, field: &'static str, message: impl Into<String>) -> Self {
        ParseError::Field {
            line,
            field,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Format one event as a trace line
pub fn format_event(event: &Event) -> String {
    match &event.kind {
        EventKind::Spawn { child } => {
            format!("G,{},{},{}", event.t_post, child, event.pos)
        }
        EventKind::RoutineExit => format!("E,{}", event.t_post),
        EventKind::ChannelNew { id, qsize } => {
            format!("N,{},{},NC,{},{}", event.t_post, id, qsize, event.pos)
        }
        EventKind::Channel {
            id,
            op,
            closed,
            op_id,
            qsize,
            qcount,
        } => format!(
            "C,{},{},{},{},{},{},{},{},{}",
            event.t_pre,
            event.t_post,
            id,
            channel_op_code(*op),
            bool_code(*closed),
            op_id,
            qsize,
            qcount,
            event.pos
        ),
        EventKind::Mutex { id, rw, op, suc } => format!(
            "M,{},{},{},{},{},{},{}",
            event.t_pre,
            event.t_post,
            id,
            bool_code(*rw),
            mutex_op_code(*op),
            bool_code(*suc),
            event.pos
        ),
        EventKind::WaitGroup {
            id,
            op,
            delta,
            value,
        } => format!(
            "W,{},{},{},{},{},{},{}",
            event.t_pre,
            event.t_post,
            id,
            match op {
                WaitGroupOpKind::AddOrDone => "A",
                WaitGroupOpKind::Wait => "W",
            },
            delta,
            value,
            event.pos
        ),
        EventKind::Select {
            id,
            cases,
            default_present,
            chosen,
        } => {
            let mut parts: Vec<String> = cases.iter().map(format_select_case).collect();
            if *default_present {
                parts.push(if *chosen < 0 { "D" } else { "d" }.to_string());
            }
            format!(
                "S,{},{},{},{},{},{}",
                event.t_pre,
                event.t_post,
                id,
                parts.join("~"),
                chosen,
                event.pos
            )
        }
        EventKind::Once { id, suc } => format!(
            "O,{},{},{},{},{}",
            event.t_pre,
            event.t_post,
            id,
            bool_code(*suc),
            event.pos
        ),
        EventKind::Cond { id, op } => format!(
            "D,{},{},{},{},{}",
            event.t_pre,
            event.t_post,
            id,
            match op {
                CondOpKind::Wait => "W",
                CondOpKind::Signal => "S",
                CondOpKind::Broadcast => "B",
            },
            event.pos
        ),
        EventKind::Atomic { id, op } => format!(
            "A,{},{},{},{}",
            event.t_pre,
            id,
            atomic_op_code(*op),
            event.pos
        ),
        EventKind::ReplayEnd { exit_code } => format!("X,{},{}", event.t_post, exit_code),
    }
}

fn format_select_case(case: &SelectCase) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{}",
        case.t_pre,
        case.t_post,
        case.channel,
        channel_op_code(case.op),
        bool_code(case.closed),
        case.op_id,
        case.qsize,
        case.qcount,
        case.pos
    )
}

fn bool_code(b: bool) -> &'static str {
    if b {
        "t"
    } else {
        "f"
    }
}

fn channel_op_code(op: ChannelOpKind) -> &'static str {
    match op {
        ChannelOpKind::Send => "S",
        ChannelOpKind::Recv => "R",
        ChannelOpKind::Close => "C",
    }
}

fn mutex_op_code(op: MutexOpKind) -> &'static str {
    match op {
        MutexOpKind::Lock => "L",
        MutexOpKind::Unlock => "U",
        MutexOpKind::TryLock => "T",
        MutexOpKind::RLock => "R",
        MutexOpKind::RUnlock => "N",
        MutexOpKind::TryRLock => "Y",
    }
}

fn atomic_op_code(op: AtomicOpKind) -> &'static str {
    match op {
        AtomicOpKind::Load => "L",
        AtomicOpKind::Store => "S",
        AtomicOpKind::Add => "A",
        AtomicOpKind::Swap => "W",
        AtomicOpKind::CompareAndSwap => "C",
        AtomicOpKind::And => "M",
        AtomicOpKind::Or => "O",
    }
}

/// Serialize one routine's events, one line per event, in recorded order
pub fn serialize_routine(events: &[Event]) -> String {
    let mut out = String::new();
    for event in events {
        out.push_str(&format_event(event));
        out.push('\n');
    }
    out
}

/// Write a trace as a directory of per-routine files plus a summary
pub fn write_trace_dir(trace: &Trace, dir: &Path) -> WeftResult<()> {
    fs::create_dir_all(dir)?;
    for routine in trace.routine_ids().collect::<Vec<_>>() {
        let path = dir.join(format!("{}{}.log", TRACE_FILE_PREFIX, routine));
        let mut file = fs::File::create(path)?;
        file.write_all(serialize_routine(trace.events_of(routine)).as_bytes())?;
    }
    write_trace_info(trace, dir)?;
    Ok(())
}

fn write_trace_info(trace: &Trace, dir: &Path) -> WeftResult<()> {
    let mut file = fs::File::create(dir.join(TRACE_INFO_FILE))?;
    writeln!(file, "routines: {}", trace.routine_ids().count())?;
    writeln!(file, "events: {}", trace.len())?;
    writeln!(file, "last_time: {}", trace.last_time())?;
    let blocked = trace.count_matching(|e| e.is_blocked());
    writeln!(file, "blocked: {}", blocked)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse one routine's trace file content
pub fn parse_routine(routine: RoutineId, content: &str) -> Result<Vec<Event>, ParseError> {
    let mut events = Vec::new();
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        events.push(parse_line(routine, i + 1, line)?);
    }
    Ok(events)
}

/// Read a trace directory written by [`write_trace_dir`]
pub fn read_trace_dir(dir: &Path) -> WeftResult<Trace> {
    let mut trace = Trace::new();
    let mut found = false;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(routine) = routine_of_file_name(name) else {
            continue;
        };
        found = true;
        let content = fs::read_to_string(entry.path())?;
        let events = parse_routine(routine, &content)?;
        trace.insert_routine(routine, events);
    }
    if !found {
        return Err(WeftError::not_found(format!(
            "no {}*.log files in {}",
            TRACE_FILE_PREFIX,
            dir.display()
        )));
    }
    Ok(trace)
}

fn routine_of_file_name(name: &str) -> Option<RoutineId> {
    let rest = name.strip_prefix(TRACE_FILE_PREFIX)?;
    let rest = rest.strip_suffix(".log")?;
    rest.parse().ok()
}

/// Parse a single trace line into an event owned by `routine`
pub fn parse_line(routine: RoutineId, line_no: usize, line: &str) -> Result<Event, ParseError> {
    let fields: Vec<&str> = line.split(',').collect();
    let kind = fields[0];
    match kind {
        "G" => {
            expect_fields(line_no, "G", &fields, 4)?;
            let t = parse_time(line_no, "tpost", fields[1])?;
            Ok(Event {
                routine,
                t_pre: t,
                t_post: t,
                pos: parse_pos(line_no, fields[3])?,
                kind: EventKind::Spawn {
                    child: parse_num(line_no, "new_id", fields[2])?,
                },
            })
        }
        "E" => {
            expect_fields(line_no, "E", &fields, 2)?;
            let t = parse_time(line_no, "tpost", fields[1])?;
            Ok(Event {
                routine,
                t_pre: t,
                t_post: t,
                pos: Position::default(),
                kind: EventKind::RoutineExit,
            })
        }
        "N" => {
            expect_fields(line_no, "N", &fields, 6)?;
            let t = parse_time(line_no, "tpost", fields[1])?;
            if fields[3] != "NC" {
                return Err(ParseError::field(line_no, "NC", "expected literal 'NC'"));
            }
            Ok(Event {
                routine,
                t_pre: t,
                t_post: t,
                pos: parse_pos(line_no, fields[5])?,
                kind: EventKind::ChannelNew {
                    id: parse_num(line_no, "id", fields[2])?,
                    qsize: parse_num(line_no, "qsize", fields[4])?,
                },
            })
        }
        "C" => {
            expect_fields(line_no, "C", &fields, 10)?;
            Ok(Event {
                routine,
                t_pre: parse_time(line_no, "tpre", fields[1])?,
                t_post: parse_time(line_no, "tpost", fields[2])?,
                pos: parse_pos(line_no, fields[9])?,
                kind: EventKind::Channel {
                    id: parse_num(line_no, "id", fields[3])?,
                    op: parse_channel_op(line_no, fields[4])?,
                    closed: parse_bool(line_no, "closed", fields[5])?,
                    op_id: parse_num(line_no, "op_id", fields[6])?,
                    qsize: parse_num(line_no, "qsize", fields[7])?,
                    qcount: parse_num(line_no, "qcount", fields[8])?,
                },
            })
        }
        "M" => {
            expect_fields(line_no, "M", &fields, 8)?;
            Ok(Event {
                routine,
                t_pre: parse_time(line_no, "tpre", fields[1])?,
                t_post: parse_time(line_no, "tpost", fields[2])?,
                pos: parse_pos(line_no, fields[7])?,
                kind: EventKind::Mutex {
                    id: parse_num(line_no, "id", fields[3])?,
                    rw: parse_bool(line_no, "rw", fields[4])?,
                    op: parse_mutex_op(line_no, fields[5])?,
                    suc: parse_bool(line_no, "suc", fields[6])?,
                },
            })
        }
        "W" => {
            expect_fields(line_no, "W", &fields, 8)?;
            Ok(Event {
                routine,
                t_pre: parse_time(line_no, "tpre", fields[1])?,
                t_post: parse_time(line_no, "tpost", fields[2])?,
                pos: parse_pos(line_no, fields[7])?,
                kind: EventKind::WaitGroup {
                    id: parse_num(line_no, "id", fields[3])?,
                    op: match fields[4] {
                        "A" => WaitGroupOpKind::AddOrDone,
                        "W" => WaitGroupOpKind::Wait,
                        other => {
                            return Err(ParseError::field(
                                line_no,
                                "op",
                                format!("unknown wait group op '{}'", other),
                            ))
                        }
                    },
                    delta: parse_signed(line_no, "delta", fields[5])?,
                    value: parse_signed(line_no, "val_after", fields[6])?,
                },
            })
        }
        "S" => parse_select(routine, line_no, &fields),
        "O" => {
            expect_fields(line_no, "O", &fields, 6)?;
            Ok(Event {
                routine,
                t_pre: parse_time(line_no, "tpre", fields[1])?,
                t_post: parse_time(line_no, "tpost", fields[2])?,
                pos: parse_pos(line_no, fields[5])?,
                kind: EventKind::Once {
                    id: parse_num(line_no, "id", fields[3])?,
                    suc: parse_bool(line_no, "suc", fields[4])?,
                },
            })
        }
        "D" => {
            expect_fields(line_no, "D", &fields, 6)?;
            Ok(Event {
                routine,
                t_pre: parse_time(line_no, "tpre", fields[1])?,
                t_post: parse_time(line_no, "tpost", fields[2])?,
                pos: parse_pos(line_no, fields[5])?,
                kind: EventKind::Cond {
                    id: parse_num(line_no, "id", fields[3])?,
                    op: match fields[4] {
                        "W" => CondOpKind::Wait,
                        "S" => CondOpKind::Signal,
                        "B" => CondOpKind::Broadcast,
                        other => {
                            return Err(ParseError::field(
                                line_no,
                                "op",
                                format!("unknown cond op '{}'", other),
                            ))
                        }
                    },
                },
            })
        }
        "A" => {
            expect_fields(line_no, "A", &fields, 5)?;
            let t = parse_time(line_no, "timer", fields[1])?;
            Ok(Event {
                routine,
                t_pre: t,
                t_post: t,
                pos: parse_pos(line_no, fields[4])?,
                kind: EventKind::Atomic {
                    id: parse_num(line_no, "addr_hash", fields[2])?,
                    op: parse_atomic_op(line_no, fields[3])?,
                },
            })
        }
        "X" => {
            expect_fields(line_no, "X", &fields, 3)?;
            let t = parse_time(line_no, "tpost", fields[1])?;
            Ok(Event {
                routine,
                t_pre: t,
                t_post: t,
                pos: Position::default(),
                kind: EventKind::ReplayEnd {
                    exit_code: parse_signed(line_no, "exit_code", fields[2])? as i32,
                },
            })
        }
        other => Err(ParseError::UnknownKind {
            line: line_no,
            kind: other.to_string(),
        }),
    }
}

/// Select lines embed commas inside the case list, so the fixed head
/// (S,tpre,tpost,id) and tail (sel_index, pos) are peeled off first and
/// the middle is rejoined before splitting on `~`.
fn parse_select(
    routine: RoutineId,
    line_no: usize,
    fields: &[&str],
) -> Result<Event, ParseError> {
    if fields.len() < 7 {
        return Err(ParseError::FieldCount {
            line: line_no,
            kind: "S",
            expected: 7,
            got: fields.len(),
        });
    }
    let n = fields.len();
    let t_pre = parse_time(line_no, "tpre", fields[1])?;
    let t_post = parse_time(line_no, "tpost", fields[2])?;
    let id = parse_num(line_no, "id", fields[3])?;
    let chosen = parse_signed(line_no, "sel_index", fields[n - 2])?;
    let pos = parse_pos(line_no, fields[n - 1])?;

    let cases_str = fields[4..n - 2].join(",");
    let mut cases = Vec::new();
    let mut default_present = false;
    for part in cases_str.split('~') {
        match part {
            "d" | "D" => default_present = true,
            _ => cases.push(parse_select_case(line_no, part)?),
        }
    }
    Ok(Event {
        routine,
        t_pre,
        t_post,
        pos,
        kind: EventKind::Select {
            id,
            cases,
            default_present,
            chosen,
        },
    })
}

fn parse_select_case(line_no: usize, part: &str) -> Result<SelectCase, ParseError> {
    let fields: Vec<&str> = part.split(',').collect();
    if fields.len() != 9 {
        return Err(ParseError::FieldCount {
            line: line_no,
            kind: "S case",
            expected: 9,
            got: fields.len(),
        });
    }
    let op = parse_channel_op(line_no, fields[3])?;
    if op == ChannelOpKind::Close {
        return Err(ParseError::field(
            line_no,
            "case op",
            "close cannot appear in a select case",
        ));
    }
    Ok(SelectCase {
        t_pre: parse_time(line_no, "case tpre", fields[0])?,
        t_post: parse_time(line_no, "case tpost", fields[1])?,
        channel: parse_num(line_no, "case id", fields[2])?,
        op,
        closed: parse_bool(line_no, "case closed", fields[4])?,
        op_id: parse_num(line_no, "case op_id", fields[5])?,
        qsize: parse_num(line_no, "case qsize", fields[6])?,
        qcount: parse_num(line_no, "case qcount", fields[7])?,
        pos: parse_pos(line_no, fields[8])?,
    })
}

fn expect_fields(
    line_no: usize,
    kind: &'static str,
    fields: &[&str],
    expected: usize,
) -> Result<(), ParseError> {
    if fields.len() != expected {
        return Err(ParseError::FieldCount {
            line: line_no,
            kind,
            expected,
            got: fields.len(),
        });
    }
    Ok(())
}

fn parse_time(line_no: usize, field: &'static str, s: &str) -> Result<u64, ParseError> {
    s.parse()
        .map_err(|_| ParseError::field(line_no, field, format!("invalid timestamp '{}'", s)))
}

fn parse_num(line_no: usize, field: &'static str, s: &str) -> Result<u64, ParseError> {
    s.parse()
        .map_err(|_| ParseError::field(line_no, field, format!("invalid number '{}'", s)))
}

fn parse_signed(line_no: usize, field: &'static str, s: &str) -> Result<i64, ParseError> {
    s.parse()
        .map_err(|_| ParseError::field(line_no, field, format!("invalid number '{}'", s)))
}

fn parse_bool(line_no: usize, field: &'static str, s: &str) -> Result<bool, ParseError> {
    match s {
        "t" => Ok(true),
        "f" => Ok(false),
        other => Err(ParseError::field(
            line_no,
            field,
            format!("expected t or f, got '{}'", other),
        )),
    }
}

fn parse_pos(line_no: usize, s: &str) -> Result<Position, ParseError> {
    Position::parse(s)
        .ok_or_else(|| ParseError::field(line_no, "pos", format!("invalid position '{}'", s)))
}

fn parse_channel_op(line_no: usize, s: &str) -> Result<ChannelOpKind, ParseError> {
    match s {
        "S" => Ok(ChannelOpKind::Send),
        "R" => Ok(ChannelOpKind::Recv),
        "C" => Ok(ChannelOpKind::Close),
        other => Err(ParseError::field(
            line_no,
            "op",
            format!("unknown channel op '{}'", other),
        )),
    }
}

fn parse_mutex_op(line_no: usize, s: &str) -> Result<MutexOpKind, ParseError> {
    match s {
        "L" => Ok(MutexOpKind::Lock),
        "U" => Ok(MutexOpKind::Unlock),
        "T" => Ok(MutexOpKind::TryLock),
        "R" => Ok(MutexOpKind::RLock),
        "N" => Ok(MutexOpKind::RUnlock),
        "Y" => Ok(MutexOpKind::TryRLock),
        other => Err(ParseError::field(
            line_no,
            "op",
            format!("unknown mutex op '{}'", other),
        )),
    }
}

fn parse_atomic_op(line_no: usize, s: &str) -> Result<AtomicOpKind, ParseError> {
    match s {
        "L" => Ok(AtomicOpKind::Load),
        "S" => Ok(AtomicOpKind::Store),
        "A" => Ok(AtomicOpKind::Add),
        "W" => Ok(AtomicOpKind::Swap),
        "C" => Ok(AtomicOpKind::CompareAndSwap),
        "M" => Ok(AtomicOpKind::And),
        "O" => Ok(AtomicOpKind::Or),
        other => Err(ParseError::field(
            line_no,
            "op",
            format!("unknown atomic op '{}'", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_events() -> Vec<Event> {
        vec![
            Event {
                routine: 1,
                t_pre: 2,
                t_post: 2,
                pos: Position::new("main.go", 3),
                kind: EventKind::ChannelNew { id: 5, qsize: 1 },
            },
            Event {
                routine: 1,
                t_pre: 4,
                t_post: 4,
                pos: Position::new("main.go", 4),
                kind: EventKind::Spawn { child: 2 },
            },
            Event {
                routine: 1,
                t_pre: 6,
                t_post: 10,
                pos: Position::new("main.go", 5),
                kind: EventKind::Channel {
                    id: 5,
                    op: ChannelOpKind::Recv,
                    closed: false,
                    op_id: 1,
                    qsize: 1,
                    qcount: 0,
                },
            },
            Event {
                routine: 1,
                t_pre: 12,
                t_post: 14,
                pos: Position::new("main.go", 6),
                kind: EventKind::Mutex {
                    id: 7,
                    rw: false,
                    op: MutexOpKind::Lock,
                    suc: true,
                },
            },
            Event {
                routine: 1,
                t_pre: 16,
                t_post: 18,
                pos: Position::new("main.go", 7),
                kind: EventKind::Select {
                    id: 9,
                    cases: vec![SelectCase {
                        t_pre: 16,
                        t_post: 18,
                        channel: 5,
                        op: ChannelOpKind::Recv,
                        closed: false,
                        op_id: 2,
                        qsize: 1,
                        qcount: 0,
                        pos: Position::new("main.go", 7),
                    }],
                    default_present: true,
                    chosen: 0,
                },
            },
            Event {
                routine: 1,
                t_pre: 20,
                t_post: 20,
                pos: Position::new("main.go", 9),
                kind: EventKind::Atomic {
                    id: 77,
                    op: AtomicOpKind::Add,
                },
            },
            Event {
                routine: 1,
                t_pre: 22,
                t_post: 22,
                pos: Position::default(),
                kind: EventKind::RoutineExit,
            },
        ]
    }

    #[test]
    fn test_roundtrip_routine() {
        let events = sample_events();
        let text = serialize_routine(&events);
        let parsed = parse_routine(1, &text).unwrap();
        assert_eq!(parsed, events);
    }

    #[test]
    fn test_roundtrip_dir() {
        let dir = tempdir().unwrap();
        let mut trace = Trace::new();
        for event in sample_events() {
            trace.add(event).unwrap();
        }
        trace
            .add(Event {
                routine: 2,
                t_pre: 8,
                t_post: 10,
                pos: Position::new("main.go", 12),
                kind: EventKind::Channel {
                    id: 5,
                    op: ChannelOpKind::Send,
                    closed: false,
                    op_id: 1,
                    qsize: 1,
                    qcount: 1,
                },
            })
            .unwrap();
        write_trace_dir(&trace, dir.path()).unwrap();
        assert!(dir.path().join(TRACE_INFO_FILE).exists());
        let loaded = read_trace_dir(dir.path()).unwrap();
        assert_eq!(loaded, trace);
    }

    #[test]
    fn test_select_default_markers() {
        // default present and chosen
        let line = "S,16,18,9,16,0,5,R,f,2,1,0,main.go:7~D,-1,main.go:7";
        let event = parse_line(1, 1, line).unwrap();
        match &event.kind {
            EventKind::Select {
                default_present,
                chosen,
                cases,
                ..
            } => {
                assert!(*default_present);
                assert_eq!(*chosen, -1);
                assert_eq!(cases.len(), 1);
            }
            other => panic!("expected select, got {:?}", other),
        }
        let back = format_event(&event);
        assert_eq!(parse_line(1, 1, &back).unwrap(), event);
    }

    #[test]
    fn test_replay_marker_roundtrip() {
        let line = "X,100,41";
        let event = parse_line(0, 1, line).unwrap();
        assert!(matches!(event.kind, EventKind::ReplayEnd { exit_code: 41 }));
        assert_eq!(format_event(&event), line);
    }

    #[test]
    fn test_errors_name_line_and_field() {
        let err = parse_routine(1, "C,2,4,5,S,x,1,0,0,main.go:3\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("line 1"), "{}", msg);
        assert!(msg.contains("closed"), "{}", msg);

        let err = parse_routine(1, "E,2\nQ,4\n").unwrap_err();
        assert!(err.to_string().contains("line 2"), "{}", err);

        let err = parse_routine(1, "M,2,4,5,t,L,t\n").unwrap_err();
        assert!(err.to_string().contains("expected 8"), "{}", err);
    }

    #[test]
    fn test_blocked_op_roundtrip() {
        let line = "C,2,0,5,S,f,0,0,0,main.go:3";
        let event = parse_line(1, 1, line).unwrap();
        assert!(event.is_blocked());
        assert_eq!(format_event(&event), line);
    }
}
