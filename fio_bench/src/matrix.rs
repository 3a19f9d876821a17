// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The benchmark matrix: every combination of operation, block size,
//! queue depth and job count is one fio test.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FioOps {
    Read,
    RandomRead,
    Write,
    RandomWrite,
    ReadWrite,
    RandRW,
}

impl FioOps {
    /// Which data directions the operation produces: (read, write).
    pub fn directions(&self) -> (bool, bool) {
        match self {
            FioOps::Read | FioOps::RandomRead => (true, false),
            FioOps::Write | FioOps::RandomWrite => (false, true),
            FioOps::ReadWrite | FioOps::RandRW => (true, true),
        }
    }
}

impl fmt::Display for FioOps {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FioOps::Read => write!(f, "read"),
            FioOps::RandomRead => write!(f, "randread"),
            FioOps::Write => write!(f, "write"),
            FioOps::RandomWrite => write!(f, "randwrite"),
            FioOps::ReadWrite => write!(f, "readwrite"),
            FioOps::RandRW => write!(f, "randrw"),
        }
    }
}

impl FromStr for FioOps {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(FioOps::Read),
            "randread" => Ok(FioOps::RandomRead),
            "write" => Ok(FioOps::Write),
            "randwrite" => Ok(FioOps::RandomWrite),
            "readwrite" | "rw" => Ok(FioOps::ReadWrite),
            "randrw" => Ok(FioOps::RandRW),
            _ => Err(Error::InvalidValue {
                dimension: "type",
                value: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for FioOps {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<FioOps> for String {
    fn from(ops: FioOps) -> Self {
        ops.to_string()
    }
}

const VALID_BLOCK_SIZES: [&str; 12] = [
    "512", "1k", "2k", "4k", "8k", "16k", "32k", "64k", "128k", "256k", "512k", "1m",
];

const VALID_COUNTS: [u32; 5] = [1, 4, 8, 16, 32];

/// Longest accepted runtime of a single test, one day.
pub const MAX_RUNTIME_SECS: u64 = 24 * 60 * 60;

/// A fio block size, in fio notation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlockSize(String);

impl BlockSize {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BlockSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if !VALID_BLOCK_SIZES.contains(&s) {
            return Err(Error::InvalidValue {
                dimension: "block size",
                value: s.to_string(),
            });
        }
        Ok(BlockSize(s.to_string()))
    }
}

impl TryFrom<String> for BlockSize {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<BlockSize> for String {
    fn from(bs: BlockSize) -> Self {
        bs.0
    }
}

fn parse_count(dimension: &'static str, s: &str) -> Result<u32> {
    s.parse::<u32>()
        .ok()
        .filter(|n| VALID_COUNTS.contains(n))
        .ok_or_else(|| Error::InvalidValue {
            dimension,
            value: s.to_string(),
        })
}

/// Parses a comma separated option list. A blank list yields `None`, which
/// keeps the default.
fn parse_list<T, F>(s: &str, parse: F) -> Result<Option<Vec<T>>>
where
    F: Fn(&str) -> Result<T>,
{
    if s.trim().is_empty() {
        return Ok(None);
    }
    s.to_lowercase()
        .split(',')
        .map(|v| parse(v.trim()))
        .collect::<Result<Vec<T>>>()
        .map(Some)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkMatrix {
    pub ops: Vec<FioOps>,
    pub block_sizes: Vec<BlockSize>,
    pub depths: Vec<u32>,
    pub jobs: Vec<u32>,
    /// Runtime of every single test.
    pub runtime_secs: u64,
    /// Amount of data each job works on, in fio notation.
    pub size: String,
}

impl Default for BenchmarkMatrix {
    fn default() -> Self {
        BenchmarkMatrix {
            ops: vec![FioOps::Read, FioOps::Write],
            block_sizes: ["4k", "64k", "1m"]
                .iter()
                .map(|s| BlockSize(s.to_string()))
                .collect(),
            depths: vec![8, 16, 32],
            jobs: vec![1, 8],
            runtime_secs: 60,
            size: String::from("1G"),
        }
    }
}

/// One fio test of the matrix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestCell {
    pub name: String,
    pub ops: FioOps,
    pub block_size: BlockSize,
    pub depth: u32,
    pub jobs: u32,
}

impl BenchmarkMatrix {
    pub fn set_ops(&mut self, s: &str) -> Result<()> {
        if let Some(ops) = parse_list(s, str::parse)? {
            self.ops = ops;
        }
        Ok(())
    }

    pub fn set_block_sizes(&mut self, s: &str) -> Result<()> {
        if let Some(block_sizes) = parse_list(s, str::parse)? {
            self.block_sizes = block_sizes;
        }
        Ok(())
    }

    pub fn set_depths(&mut self, s: &str) -> Result<()> {
        if let Some(depths) = parse_list(s, |v| parse_count("depth", v))? {
            self.depths = depths;
        }
        Ok(())
    }

    pub fn set_jobs(&mut self, s: &str) -> Result<()> {
        if let Some(jobs) = parse_list(s, |v| parse_count("jobs", v))? {
            self.jobs = jobs;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (dimension, len) in [
            ("type", self.ops.len()),
            ("block size", self.block_sizes.len()),
            ("depth", self.depths.len()),
            ("jobs", self.jobs.len()),
        ] {
            if len == 0 {
                return Err(Error::EmptyDimension(dimension));
            }
        }
        for (dimension, values) in [("depth", &self.depths), ("jobs", &self.jobs)] {
            if let Some(v) = values.iter().find(|v| !VALID_COUNTS.contains(*v)) {
                return Err(Error::InvalidValue {
                    dimension,
                    value: v.to_string(),
                });
            }
        }
        if self.runtime_secs == 0 || self.runtime_secs > MAX_RUNTIME_SECS {
            return Err(Error::InvalidValue {
                dimension: "runtime",
                value: self.runtime_secs.to_string(),
            });
        }
        Ok(())
    }

    pub fn test_count(&self) -> usize {
        self.ops.len() * self.block_sizes.len() * self.depths.len() * self.jobs.len()
    }

    pub fn runtime(&self) -> Duration {
        Duration::from_secs(self.runtime_secs)
    }

    /// Time fio needs to go through the whole matrix.
    pub fn expected_duration(&self) -> Duration {
        let count = u32::try_from(self.test_count()).unwrap_or(u32::MAX);
        self.runtime().saturating_mul(count)
    }

    /// The tests in execution order. Names are `<type>-<bs>-<n>` where `n`
    /// counts the depth/jobs combinations of one type and block size.
    pub fn cells(&self) -> Vec<TestCell> {
        let mut cells = Vec::with_capacity(self.test_count());
        for ops in &self.ops {
            for bs in &self.block_sizes {
                let mut count = 0;
                for depth in &self.depths {
                    for jobs in &self.jobs {
                        cells.push(TestCell {
                            name: format!("{ops}-{bs}-{count}"),
                            ops: *ops,
                            block_size: bs.clone(),
                            depth: *depth,
                            jobs: *jobs,
                        });
                        count += 1;
                    }
                }
            }
        }
        cells
    }
}
