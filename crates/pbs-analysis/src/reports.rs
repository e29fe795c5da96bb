//! CSV report writers.
//!
//! Three outputs per run: a per-block ledger with every builder's bid and
//! block value, a per-transaction listing, and a PBS-vs-POS comparison with
//! side-by-side transaction columns. Writers target any `io::Write`; the
//! `save_*` wrappers add buffered files with error context.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use eyre::{Context, Result};
use tracing::info;

use pbs_data::types::Block;

use crate::revenue::reward_of;

/// Per-block ledger.
///
/// Base columns first, then one bid column and one block-value column per
/// builder id seen in the first block's auction snapshot.
pub fn write_block_data<W: Write>(out: &mut W, blocks: &[Block]) -> Result<()> {
    write!(
        out,
        "Block Number,Proposer ID,Builder ID,Winning Bid Value,Winning Block Value,Reward"
    )?;

    let builder_ids: Vec<u32> = blocks
        .first()
        .map(|block| block.all_bids.keys().copied().collect())
        .unwrap_or_default();
    for id in &builder_ids {
        write!(out, ",Builder ID {id} Bid")?;
    }
    for id in &builder_ids {
        write!(out, ",Builder ID {id} Block Value")?;
    }

    for (at, block) in blocks.iter().enumerate() {
        let reward = reward_of(block.block_value, block.bid, block.builder_id, block.proposer_id);
        write!(
            out,
            "\n{},{},{},{},{},{}",
            at + 1,
            block.proposer_id,
            block.builder_id,
            block.bid,
            block.block_value,
            reward
        )?;
        for id in &builder_ids {
            match block.all_bids.get(id) {
                Some(bid) => write!(out, ",{bid}")?,
                None => write!(out, ",")?,
            }
        }
        for id in &builder_ids {
            match block.all_block_values.get(id) {
                Some(value) => write!(out, ",{value}")?,
                None => write!(out, ",")?,
            }
        }
    }
    writeln!(out)?;
    Ok(())
}

/// Per-transaction listing: one block header row, then one row per included
/// transaction with the block columns left empty.
pub fn write_transaction_data<W: Write>(out: &mut W, blocks: &[Block]) -> Result<()> {
    writeln!(
        out,
        "Block ID,Block Bid,Builder ID,Block Value,Transaction ID,Transaction GAS,Transaction MEV"
    )?;
    for (at, block) in blocks.iter().enumerate() {
        writeln!(
            out,
            "{},{},{},{}",
            at + 1,
            block.bid,
            block.builder_id,
            block.block_value
        )?;
        for tx in &block.transactions {
            writeln!(out, ",,,,{},{},{}", tx.id, tx.gas, tx.mev)?;
        }
    }
    Ok(())
}

/// PBS-vs-POS comparison: paired rows per block number with side-by-side
/// transaction listings, padded with empty fields where the counts differ.
pub fn write_comparison_data<W: Write>(out: &mut W, pbs: &[Block], pos: &[Block]) -> Result<()> {
    writeln!(
        out,
        "Block Number,PBS Builder ID,POS Builder ID,Proposer ID,PBS Bid Value,\
         PBS Block Value,POS Block Value,PBS Transaction ID,PBS Transaction GAS,\
         PBS Transaction MEV,POS Transaction ID,POS Transaction GAS,POS Transaction MEV"
    )?;

    for (at, (pbs_block, pos_block)) in pbs.iter().zip(pos.iter()).enumerate() {
        writeln!(
            out,
            "{},{},{},{},{},{},{}",
            at + 1,
            pbs_block.builder_id,
            pos_block.builder_id,
            pbs_block.proposer_id,
            pbs_block.bid,
            pbs_block.block_value,
            pos_block.block_value
        )?;

        let rows = pbs_block.transactions.len().max(pos_block.transactions.len());
        for j in 0..rows {
            write!(out, ",,,,,,")?;
            match pbs_block.transactions.get(j) {
                Some(tx) => write!(out, ",{},{},{}", tx.id, tx.gas, tx.mev)?,
                None => write!(out, ",,,")?,
            }
            match pos_block.transactions.get(j) {
                Some(tx) => writeln!(out, ",{},{},{}", tx.id, tx.gas, tx.mev)?,
                None => writeln!(out, ",,,")?,
            }
        }
    }
    Ok(())
}

pub fn save_block_data(path: &Path, blocks: &[Block]) -> Result<()> {
    let mut out = buffered(path)?;
    write_block_data(&mut out, blocks)?;
    out.flush()?;
    info!(path = %path.display(), blocks = blocks.len(), "wrote block report");
    Ok(())
}

pub fn save_transaction_data(path: &Path, blocks: &[Block]) -> Result<()> {
    let mut out = buffered(path)?;
    write_transaction_data(&mut out, blocks)?;
    out.flush()?;
    info!(path = %path.display(), blocks = blocks.len(), "wrote transaction report");
    Ok(())
}

pub fn save_comparison_data(path: &Path, pbs: &[Block], pos: &[Block]) -> Result<()> {
    let mut out = buffered(path)?;
    write_comparison_data(&mut out, pbs, pos)?;
    out.flush()?;
    info!(path = %path.display(), blocks = pbs.len().min(pos.len()), "wrote comparison report");
    Ok(())
}

fn buffered(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path)
        .wrap_err_with(|| format!("failed to create report file {}", path.display()))?;
    Ok(BufWriter::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbs_data::types::Transaction;

    fn sample_block(builder_id: u32, proposer_id: u32, bid: f64, txs: Vec<Transaction>) -> Block {
        let mut block = Block::new(builder_id);
        block.proposer_id = proposer_id;
        block.bid = bid;
        for tx in txs {
            block.block_value += tx.gas + tx.mev;
            block.transactions.push(tx.into());
        }
        block.all_bids.insert(builder_id, bid);
        block.all_bids.insert(builder_id + 1, bid / 2.0);
        block.all_block_values.insert(builder_id, block.block_value);
        block
            .all_block_values
            .insert(builder_id + 1, block.block_value / 2.0);
        block
    }

    fn rendered(blocks: &[Block]) -> String {
        let mut buf = Vec::new();
        write_block_data(&mut buf, blocks).expect("write");
        String::from_utf8(buf).expect("utf8")
    }

    #[test]
    fn block_report_lists_auction_columns() {
        let blocks = vec![sample_block(
            3,
            9,
            40.5,
            vec![Transaction::new(1, 60.0, 0.0), Transaction::new(2, 30.5, 0.0)],
        )];
        let text = rendered(&blocks);
        let mut lines = text.lines();

        let header = lines.next().expect("header");
        assert_eq!(
            header,
            "Block Number,Proposer ID,Builder ID,Winning Bid Value,Winning Block Value,Reward,\
             Builder ID 3 Bid,Builder ID 4 Bid,Builder ID 3 Block Value,Builder ID 4 Block Value"
        );

        let row = lines.next().expect("row");
        assert_eq!(row, "1,9,3,40.5,90.5,50,40.5,20.25,90.5,45.25");
    }

    #[test]
    fn block_report_numeric_fields_round_trip() {
        let blocks = vec![
            sample_block(1, 2, 33.25, vec![Transaction::new(5, 10.125, 0.0)]),
            sample_block(2, 2, 17.5, vec![Transaction::new(6, 99.9, 1.25)]),
        ];
        let text = rendered(&blocks);

        for (at, line) in text.lines().skip(1).enumerate() {
            let fields: Vec<&str> = line.split(',').collect();
            let bid: f64 = fields[3].parse().expect("bid parses");
            let value: f64 = fields[4].parse().expect("value parses");
            assert_eq!(bid, blocks[at].bid);
            assert_eq!(value, blocks[at].block_value);
        }
    }

    #[test]
    fn transaction_report_pads_block_columns() {
        let blocks = vec![sample_block(
            1,
            2,
            5.0,
            vec![Transaction::new(7, 20.0, 0.0), Transaction::new(8, 10.0, 3.5)],
        )];

        let mut buf = Vec::new();
        write_transaction_data(&mut buf, &blocks).expect("write");
        let text = String::from_utf8(buf).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(
            lines[0],
            "Block ID,Block Bid,Builder ID,Block Value,Transaction ID,Transaction GAS,Transaction MEV"
        );
        assert_eq!(lines[1], "1,5,1,33.5");
        assert_eq!(lines[2], ",,,,7,20,0");
        assert_eq!(lines[3], ",,,,8,10,3.5");
    }

    #[test]
    fn comparison_report_pads_shorter_side() {
        let pbs = vec![sample_block(
            1,
            9,
            12.0,
            vec![Transaction::new(10, 5.0, 0.0), Transaction::new(11, 4.0, 0.0)],
        )];
        let pos = vec![sample_block(2, 9, 0.0, vec![Transaction::new(12, 3.0, 0.0)])];

        let mut buf = Vec::new();
        write_comparison_data(&mut buf, &pbs, &pos).expect("write");
        let text = String::from_utf8(buf).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[1], "1,1,2,9,12,9,3");
        assert_eq!(lines[2], ",,,,,,,10,5,0,12,3,0");
        assert_eq!(lines[3], ",,,,,,,11,4,0,,,");
    }

    #[test]
    fn empty_chain_reports_only_headers() {
        let mut buf = Vec::new();
        write_block_data(&mut buf, &[]).expect("write");
        let text = String::from_utf8(buf).expect("utf8");
        assert_eq!(
            text.trim_end(),
            "Block Number,Proposer ID,Builder ID,Winning Bid Value,Winning Block Value,Reward"
        );
    }
}
