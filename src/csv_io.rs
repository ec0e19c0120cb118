//! CSV I/O - command scripts in, tree and commission snapshots out
//!
//! Command file format (header required):
//!
//! ```text
//! action,node_id,value,option
//! place,ROOT,,L            # place under ROOT, prefer Left
//! enroll,ROOT_Left,1001,direct
//! volume,ROOT_Left,250,
//! active,ROOT_Left,0,
//! ```

use anyhow::{Context, Result, bail};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};

use crate::core_types::{NodeId, PromoterId};
use crate::models::{CommissionEvent, PlacementMethod, Position, Side};

// ============================================================
// Constants
// ============================================================

pub const COMMANDS_CSV: &str = "fixtures/commands.csv";
pub const POSITIONS_CSV: &str = "positions.csv";
pub const COMMISSIONS_CSV: &str = "commissions.csv";

pub const ACTION_PLACE: &str = "place";
pub const ACTION_ENROLL: &str = "enroll";
pub const ACTION_VOLUME: &str = "volume";
pub const ACTION_ACTIVE: &str = "active";

// ============================================================
// Command Loading
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputCommand {
    Place {
        anchor: NodeId,
        preferred_side: Option<Side>,
    },
    Enroll {
        node_id: NodeId,
        promoter_id: PromoterId,
        method: PlacementMethod,
    },
    Volume {
        node_id: NodeId,
        amount: i64,
    },
    SetActive {
        node_id: NodeId,
        is_active: bool,
    },
}

pub fn load_commands(path: &str) -> Result<Vec<InputCommand>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path))?;
    parse_commands(BufReader::new(file)).with_context(|| format!("Failed to parse {}", path))
}

pub fn parse_commands<R: BufRead>(reader: R) -> Result<Vec<InputCommand>> {
    let mut commands = Vec::new();

    for (line_num, line) in reader.lines().skip(1).enumerate() {
        let line = line?;
        let line_no = line_num + 2;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = trimmed.split(',').map(str::trim).collect();
        if parts.len() < 2 {
            bail!("Expected at least action,node_id at line {}", line_no);
        }
        let node_id = NodeId::from(parts[1]);
        let value = parts.get(2).copied().unwrap_or("");
        let option = parts.get(3).copied().unwrap_or("");

        let command = match parts[0] {
            ACTION_PLACE => InputCommand::Place {
                anchor: node_id,
                preferred_side: if option.is_empty() {
                    None
                } else {
                    Some(
                        option
                            .parse()
                            .with_context(|| format!("Invalid side at line {}", line_no))?,
                    )
                },
            },
            ACTION_ENROLL => InputCommand::Enroll {
                node_id,
                promoter_id: value
                    .parse()
                    .with_context(|| format!("Invalid promoter_id at line {}", line_no))?,
                method: parse_method(option)
                    .with_context(|| format!("Invalid placement method at line {}", line_no))?,
            },
            ACTION_VOLUME => InputCommand::Volume {
                node_id,
                amount: value
                    .parse()
                    .with_context(|| format!("Invalid volume at line {}", line_no))?,
            },
            ACTION_ACTIVE => InputCommand::SetActive {
                node_id,
                is_active: match value.to_ascii_lowercase().as_str() {
                    "1" | "true" | "yes" => true,
                    "0" | "false" | "no" => false,
                    _ => bail!("Invalid active flag '{}' at line {}", value, line_no),
                },
            },
            other => bail!("Unknown action '{}' at line {}", other, line_no),
        };
        commands.push(command);
    }

    Ok(commands)
}

fn parse_method(s: &str) -> Result<PlacementMethod> {
    match s.to_ascii_lowercase().as_str() {
        "" | "spillover" => Ok(PlacementMethod::Spillover),
        "direct" => Ok(PlacementMethod::Direct),
        other => bail!("unknown placement method '{}'", other),
    }
}

// ============================================================
// Snapshots
// ============================================================

/// Dump positions as CSV, one row per node in position-number order
pub fn dump_positions(positions: &[Position], path: &str) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path))?;
    write_positions(positions, BufWriter::new(file))
}

pub fn write_positions<W: Write>(positions: &[Position], mut out: W) -> Result<()> {
    writeln!(
        out,
        "position_number,node_id,path,level,side,parent,promoter_id,is_active,personal_volume,left_leg_volume,right_leg_volume,subtree_size,cycles_completed"
    )?;
    for p in positions {
        writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{},{},{},{}",
            p.position_number,
            p.node_id,
            p.path,
            p.level(),
            p.side.map(|s| s.as_str()).unwrap_or(""),
            p.parent.as_ref().map(|n| n.as_str()).unwrap_or(""),
            p.occupant
                .as_ref()
                .map(|o| o.promoter_id.to_string())
                .unwrap_or_default(),
            p.occupant.as_ref().is_some_and(|o| o.is_active),
            p.personal_volume,
            p.left_leg_volume,
            p.right_leg_volume,
            p.subtree_size,
            p.cycles_completed
        )?;
    }
    out.flush()?;
    Ok(())
}

pub fn dump_commissions(events: &[CommissionEvent], path: &str) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "seq,commission_id,node_id,recipient,amount,type,created_at")?;
    for e in events {
        writeln!(
            out,
            "{},{},{},{},{},{},{}",
            e.seq,
            e.id,
            e.node_id(),
            e.recipient,
            e.amount,
            e.commission_type.as_str(),
            e.created_at.to_rfc3339()
        )?;
    }
    out.flush()?;
    Ok(())
}
