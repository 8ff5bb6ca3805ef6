//! Parsing `chmod`-style permission strings.
//!
//! Cache and tool configuration accepts either a bare octal mode (`"0644"`)
//! or a comma-separated list of symbolic clauses (`"u+rw,go+r"`, `"a=rx"`),
//! the same grammar `chmod(1)` accepts for symbolic modes. Parsing never
//! needs to know the *current* mode of anything (there's no `X`-if-already-
//! executable special case here); it just produces a function from an
//! existing mode to a new one.

use crate::error::{CONFIG_ERROR, Error};

const USER_READ: u32 = 0o400;
const USER_WRITE: u32 = 0o200;
const USER_EXEC: u32 = 0o100;
const GROUP_READ: u32 = 0o040;
const GROUP_WRITE: u32 = 0o020;
const GROUP_EXEC: u32 = 0o010;
const OTHER_READ: u32 = 0o004;
const OTHER_WRITE: u32 = 0o002;
const OTHER_EXEC: u32 = 0o001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Remove,
    Set,
}

#[derive(Debug, Clone)]
struct Clause {
    owners_mask: u32,
    read: bool,
    write: bool,
    exec: bool,
    op: Op,
}

/// A parsed permission specification: either an absolute octal mode, or a
/// sequence of symbolic clauses applied in order.
#[derive(Debug, Clone)]
pub enum Perm {
    Octal(u32),
    Symbolic(Vec<Clause>),
}

impl Perm {
    /// Parse a permission string.
    ///
    /// A string consisting only of octal digits (and at most 4 of them) is
    /// treated as an absolute mode. Otherwise it's parsed as one or more
    /// comma-separated symbolic clauses of the form
    /// `[ugoa]*[+-=][rwx]+`.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let trimmed = input.trim();
        if !trimmed.is_empty() && trimmed.len() <= 4 && trimmed.chars().all(|c| ('0'..='7').contains(&c)) {
            let mode = u32::from_str_radix(trimmed, 8)
                .map_err(|err| Error::new(format!("invalid octal mode {trimmed:?}: {err}")).with_code(CONFIG_ERROR))?;
            return Ok(Perm::Octal(mode));
        }

        let clauses = trimmed
            .split(',')
            .map(parse_clause)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Perm::Symbolic(clauses))
    }

    /// Apply this permission spec to an existing mode (only the low 9 bits
    /// are touched; any setuid/setgid/sticky bits in `mode` pass through
    /// unchanged for symbolic specs, and are cleared for an absolute mode
    /// unless it explicitly includes them).
    pub fn apply(&self, mode: u32) -> u32 {
        match self {
            Perm::Octal(m) => *m,
            Perm::Symbolic(clauses) => clauses.iter().fold(mode, |mode, clause| clause.apply(mode)),
        }
    }
}

impl Clause {
    fn apply(&self, mode: u32) -> u32 {
        let mut bits = 0;
        if self.owners_mask & OWNER_USER != 0 {
            bits |= (if self.read { USER_READ } else { 0 })
                | (if self.write { USER_WRITE } else { 0 })
                | (if self.exec { USER_EXEC } else { 0 });
        }
        if self.owners_mask & OWNER_GROUP != 0 {
            bits |= (if self.read { GROUP_READ } else { 0 })
                | (if self.write { GROUP_WRITE } else { 0 })
                | (if self.exec { GROUP_EXEC } else { 0 });
        }
        if self.owners_mask & OWNER_OTHER != 0 {
            bits |= (if self.read { OTHER_READ } else { 0 })
                | (if self.write { OTHER_WRITE } else { 0 })
                | (if self.exec { OTHER_EXEC } else { 0 });
        }

        let owned_bits = full_mask_for(self.owners_mask);
        match self.op {
            Op::Add => mode | bits,
            Op::Remove => mode & !bits,
            Op::Set => (mode & !owned_bits) | bits,
        }
    }
}

const OWNER_USER: u32 = 1 << 0;
const OWNER_GROUP: u32 = 1 << 1;
const OWNER_OTHER: u32 = 1 << 2;

fn full_mask_for(owners_mask: u32) -> u32 {
    let mut mask = 0;
    if owners_mask & OWNER_USER != 0 {
        mask |= USER_READ | USER_WRITE | USER_EXEC;
    }
    if owners_mask & OWNER_GROUP != 0 {
        mask |= GROUP_READ | GROUP_WRITE | GROUP_EXEC;
    }
    if owners_mask & OWNER_OTHER != 0 {
        mask |= OTHER_READ | OTHER_WRITE | OTHER_EXEC;
    }
    mask
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Owners,
    Perms,
}

fn parse_clause(clause: &str) -> Result<Clause, Error> {
    let clause = clause.trim();
    let mut owners_mask = 0;
    let mut op = None;
    let mut read = false;
    let mut write = false;
    let mut exec = false;
    let mut state = ParseState::Owners;

    for ch in clause.chars() {
        match state {
            ParseState::Owners => match ch {
                'u' => owners_mask |= OWNER_USER,
                'g' => owners_mask |= OWNER_GROUP,
                'o' => owners_mask |= OWNER_OTHER,
                'a' => owners_mask |= OWNER_USER | OWNER_GROUP | OWNER_OTHER,
                '+' | '-' | '=' => {
                    if owners_mask == 0 {
                        owners_mask = OWNER_USER | OWNER_GROUP | OWNER_OTHER;
                    }
                    op = Some(parse_op(ch));
                    state = ParseState::Perms;
                }
                c => return Err(invalid_clause(clause, c)),
            },
            ParseState::Perms => match ch {
                'r' => read = true,
                'w' => write = true,
                'x' | 'X' => exec = true,
                c => return Err(invalid_clause(clause, c)),
            },
        }
    }

    let op = op.ok_or_else(|| Error::new(format!("missing +/-/= in permission clause: {clause:?}")).with_code(CONFIG_ERROR))?;

    Ok(Clause {
        owners_mask,
        read,
        write,
        exec,
        op,
    })
}

fn parse_op(ch: char) -> Op {
    match ch {
        '+' => Op::Add,
        '-' => Op::Remove,
        '=' => Op::Set,
        _ => unreachable!("caller only passes +/-/="),
    }
}

fn invalid_clause(clause: &str, unexpected: char) -> Error {
    Error::new(format!("unexpected character {unexpected:?} in permission clause: {clause:?}")).with_code(CONFIG_ERROR)
}
