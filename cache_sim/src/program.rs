//! Access sequences fed to a [`Port`](crate::sim::Port)

use std::fmt;

use anyhow::{anyhow, Result};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case},
    character::complete::{digit1, hex_digit1, space0, space1},
    combinator::{all_consuming, map, map_res},
    sequence::{preceded, tuple},
    IResult,
};

use crate::memory::Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read(Addr),
    Write(Addr, u32),
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read(addr) => write!(f, "read {addr}"),
            Access::Write(addr, v) => write!(f, "write {addr} {v:#x}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    accesses: Vec<Access>,
}

impl Program {
    pub fn new(accesses: Vec<Access>) -> Self {
        Self { accesses }
    }
    /// sequential reads of 0x0..=0x5.
    pub fn reference() -> Self {
        Self::new((0..=5).map(|a| Access::Read(Addr::new(a))).collect())
    }
    pub fn accesses(&self) -> &[Access] {
        &self.accesses
    }
    pub fn len(&self) -> usize {
        self.accesses.len()
    }
    pub fn is_empty(&self) -> bool {
        self.accesses.is_empty()
    }
    /// One access per line: `r <addr>` or `w <addr> <value>` (also `read`/`write`).
    /// Numbers are decimal or `0x`-prefixed hex; `#` starts a comment.
    pub fn parse(src: &str) -> Result<Self> {
        let mut accesses = Vec::new();
        for (lineno, line) in src.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let (_, access) = all_consuming(access)(line)
                .map_err(|e| anyhow!("failed to parse line {}: {e}", lineno + 1))?;
            accesses.push(access);
        }
        Ok(Self::new(accesses))
    }
}

fn number(input: &str) -> IResult<&str, u64> {
    alt((
        map_res(preceded(tag_no_case("0x"), hex_digit1), |s| {
            u64::from_str_radix(s, 16)
        }),
        map_res(digit1, str::parse),
    ))(input)
}

fn address(input: &str) -> IResult<&str, Addr> {
    map_res(number, |n| usize::try_from(n).map(Addr::new))(input)
}

fn value(input: &str) -> IResult<&str, u32> {
    map_res(number, u32::try_from)(input)
}

fn access(input: &str) -> IResult<&str, Access> {
    let (input, _) = space0(input)?;
    alt((
        map(
            tuple((alt((tag("write"), tag("w"))), space1, address, space1, value)),
            |(_, _, addr, _, v)| Access::Write(addr, v),
        ),
        map(
            preceded(tuple((alt((tag("read"), tag("r"))), space1)), address),
            Access::Read,
        ),
    ))(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference() {
        let p = Program::reference();
        assert_eq!(6, p.len());
        assert_eq!(Access::Read(Addr::new(0)), p.accesses()[0]);
        assert_eq!(Access::Read(Addr::new(5)), p.accesses()[5]);
    }
    #[test]
    fn test_parse() {
        let src = "# warm up
r 0x0
read 17
  w 0x1F 142   # trailing comment

write 0X20 0x1ff
";
        let p = Program::parse(src).unwrap();
        assert_eq!(
            &[
                Access::Read(Addr::new(0)),
                Access::Read(Addr::new(17)),
                Access::Write(Addr::new(0x1f), 142),
                Access::Write(Addr::new(0x20), 0x1ff),
            ],
            p.accesses()
        );
    }
    #[test]
    fn test_parse_error_reports_line() {
        let e = Program::parse("r 0x0\nw 0x4\n").unwrap_err();
        assert!(e.to_string().contains("line 2"), "{e}");
        assert!(Program::parse("r 0xzz").is_err());
        assert!(Program::parse("x 1").is_err());
        assert!(Program::parse("w 1 0x100000000").is_err());
    }
    #[test]
    fn test_display() {
        assert_eq!("read 0x0010", Access::Read(Addr::new(16)).to_string());
        assert_eq!(
            "write 0x0001 0x8e",
            Access::Write(Addr::new(1), 142).to_string()
        );
    }
}
