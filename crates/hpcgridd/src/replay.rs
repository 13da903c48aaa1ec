//! Ordered event log replay.
//!
//! The log is JSON lines. Each line carries the block position it was
//! sequenced at and exactly one action:
//!
//! ```text
//! {"height":1,"time":100,"deposit":{"address":"alice","amount":50000}}
//! {"height":2,"time":110,"msg":{"type":"submit_job", ...}}
//! {"height":9,"time":700,"cycle":true}
//! ```
//!
//! Deposits fund the in-process escrow. Blank lines and lines starting
//! with `#` are skipped.

use std::collections::BTreeSet;
use std::io::{BufRead, Write};

use anyhow::{Context, bail};
use serde::Deserialize;
use tracing::{debug, info, warn};

use hpc_core::{Address, Amount, BlockContext};
use hpcgrid_keeper::{EngineEvent, Keeper, Msg};
use hpcgrid_settlement::{Account, Escrow, InMemoryEscrow};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Deposit {
    pub address: Address,
    pub amount: Amount,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LogLine {
    height: u64,
    time: u64,
    #[serde(default)]
    msg: Option<Msg>,
    #[serde(default)]
    deposit: Option<Deposit>,
    #[serde(default)]
    cycle: bool,
}

#[derive(Debug)]
pub enum Action {
    Msg(Box<Msg>),
    Deposit(Deposit),
    Cycle,
}

/// Parse one log line. `Ok(None)` for blank and comment lines.
pub fn parse_line(line: &str) -> anyhow::Result<Option<(BlockContext, Action)>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let raw: LogLine = serde_json::from_str(line)?;
    let ctx = BlockContext::new(raw.height, raw.time);
    let action = match (raw.msg, raw.deposit, raw.cycle) {
        (Some(msg), None, false) => Action::Msg(Box::new(msg)),
        (None, Some(deposit), false) => Action::Deposit(deposit),
        (None, None, true) => Action::Cycle,
        _ => bail!("expected exactly one of msg, deposit or cycle"),
    };
    Ok(Some((ctx, action)))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub lines: usize,
    pub applied: usize,
    pub rejected: usize,
    pub deposits: usize,
    pub cycles: usize,
    pub events: usize,
}

pub struct Replayer {
    keeper: Keeper<InMemoryEscrow>,
    last: Option<BlockContext>,
    funded: BTreeSet<Address>,
    summary: ReplaySummary,
}

impl Replayer {
    pub fn new(keeper: Keeper<InMemoryEscrow>) -> Self {
        Self {
            keeper,
            last: None,
            funded: BTreeSet::new(),
            summary: ReplaySummary::default(),
        }
    }

    pub fn summary(&self) -> &ReplaySummary {
        &self.summary
    }

    /// Apply every line of `reader`, writing produced events to `out`.
    pub fn run(&mut self, reader: impl BufRead, out: &mut impl Write) -> anyhow::Result<()> {
        for (idx, line) in reader.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.with_context(|| format!("reading line {line_no}"))?;
            let Some((ctx, action)) =
                parse_line(&line).with_context(|| format!("parsing line {line_no}"))?
            else {
                continue;
            };
            self.step(line_no, ctx, action, out)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Apply a single action. Rejected messages are logged and skipped;
    /// store failures and out-of-order positions abort the replay.
    pub fn step(
        &mut self,
        line_no: usize,
        ctx: BlockContext,
        action: Action,
        out: &mut impl Write,
    ) -> anyhow::Result<()> {
        if let Some(last) = self.last {
            if ctx.height < last.height || ctx.time < last.time {
                bail!(
                    "line {line_no}: position {}@{} precedes {}@{}",
                    ctx.height,
                    ctx.time,
                    last.height,
                    last.time
                );
            }
        }
        self.last = Some(ctx);
        self.summary.lines += 1;

        match action {
            Action::Deposit(deposit) => {
                self.keeper
                    .escrow_mut()
                    .deposit(&deposit.address, deposit.amount);
                self.funded.insert(deposit.address);
                self.summary.deposits += 1;
            }
            Action::Cycle => {
                let events = self
                    .keeper
                    .process_cycle(&ctx)
                    .with_context(|| format!("line {line_no}: processing cycle"))?;
                debug!(line = line_no, height = ctx.height, events = events.len(), "cycle processed");
                self.summary.cycles += 1;
                self.emit(line_no, &ctx, &events, out)?;
            }
            Action::Msg(msg) => {
                let kind = msg.kind();
                match self.keeper.apply(&ctx, *msg) {
                    Ok(events) => {
                        debug!(line = line_no, kind, events = events.len(), "message applied");
                        self.summary.applied += 1;
                        self.emit(line_no, &ctx, &events, out)?;
                    }
                    Err(e) => {
                        warn!(line = line_no, kind, class = ?e.class(), error = %e, "message rejected");
                        self.summary.rejected += 1;
                        self.emit(line_no, &ctx, e.events(), out)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Escrow balances of every deposited address plus the treasury.
    pub fn balances(&self) -> anyhow::Result<Vec<(Address, Amount)>> {
        let treasury = self.keeper.params()?.settlement.treasury_address;
        let mut addresses = self.funded.clone();
        addresses.insert(treasury);
        Ok(addresses
            .into_iter()
            .map(|a| {
                let balance = self.keeper.escrow().balance(&Account::address(&a));
                (a, balance)
            })
            .collect())
    }

    fn emit(
        &mut self,
        line_no: usize,
        ctx: &BlockContext,
        events: &[EngineEvent],
        out: &mut impl Write,
    ) -> anyhow::Result<()> {
        for event in events {
            info!(line = line_no, height = ctx.height, event = event.name(), "event");
            let record = serde_json::json!({
                "line": line_no,
                "height": ctx.height,
                "time": ctx.time,
                "event": event,
            });
            writeln!(out, "{record}")?;
        }
        self.summary.events += events.len();
        Ok(())
    }
}
