use prettytable::{self, format, row};
use std::fmt;

use crate::platform::PlatformInfo;
use crate::scheduler::{BlockScheduler, Scheduler};
use crate::select::TilingParams;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum SchedulePrintStyle {
    /// Every loop with its block coordinate and clipped shape.
    Full,
    /// One row per core listing its block coordinates.
    Compact,
}

/// Pretty-print the decisions in a [TilingParams] to stdout.
pub fn pprint_params(params: &TilingParams, platform: &PlatformInfo) {
    params_table(params, platform).printstd()
}

pub fn pprint_params_string(params: &TilingParams, platform: &PlatformInfo) -> String {
    format!("{}", params_table(params, platform))
}

/// Pretty-print which blocks each core of a launch handles.
pub fn pprint_schedule(params: &TilingParams, style: SchedulePrintStyle) {
    schedule_table(params, style).printstd()
}

pub fn pprint_schedule_write<W: fmt::Write>(
    out: &mut W,
    params: &TilingParams,
    style: SchedulePrintStyle,
) -> fmt::Result {
    write!(out, "{}", schedule_table(params, style))
}

pub fn pprint_schedule_string(params: &TilingParams, style: SchedulePrintStyle) -> String {
    format!("{}", schedule_table(params, style))
}

fn params_table(params: &TilingParams, platform: &PlatformInfo) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    table.set_titles(row!["Field", "Value"]);
    let l0 = match params.l1_tile.derive_l0(params.dtype, platform, 2) {
        Ok(t) => t.to_string(),
        Err(e) => e.to_string(),
    };
    let p = &params.padding;
    table.add_row(row!["kernel", params.kernel]);
    table.add_row(row!["problem", params.problem]);
    table.add_row(row!["layouts", format!("{} x {}", params.layout_a, params.layout_b)]);
    table.add_row(row!["dtype", params.dtype]);
    table.add_row(row!["L1 tile", params.l1_tile]);
    table.add_row(row!["L0 tile", l0]);
    table.add_row(row!["blocks", params.blocks()]);
    table.add_row(row!["split-K", params.splitk_factor]);
    table.add_row(row!["swizzle", params.swizzle]);
    table.add_row(row!["padding", format!("A {:?}, B {:?}, C {:?}", p.a, p.b, p.c)]);
    table.add_row(row!["cores", format!("{} of {}", params.block_dim, platform.core_num)]);
    table.add_row(row!["tiling key", params.tiling_key()]);
    table.set_format(plain_format());
    table
}

fn schedule_table(params: &TilingParams, style: SchedulePrintStyle) -> prettytable::Table {
    let scheduler = Scheduler::for_params(params);
    let core_num = params.block_dim;
    let mut table = prettytable::Table::new();
    table.set_titles(match style {
        SchedulePrintStyle::Full => row!["Core", "Loop", "Block", "Shape"],
        SchedulePrintStyle::Compact => row!["Core", "Blocks"],
    });
    for core in 0..core_num {
        let coords = (0..scheduler.single_core_loops(core, core_num))
            .map(|local| scheduler.core_block_coord(core, core_num, local));
        match style {
            SchedulePrintStyle::Full => {
                for (local, coord) in coords.enumerate() {
                    table.add_row(row![
                        core,
                        local,
                        coord,
                        scheduler.actual_block_shape(coord)
                    ]);
                }
            }
            SchedulePrintStyle::Compact => {
                let joined = coords
                    .map(|c| format!("({},{},{})", c.m, c.n, c.k))
                    .collect::<Vec<_>>()
                    .join(" ");
                table.add_row(row![core, joined]);
            }
        }
    }
    table.set_format(plain_format());
    table
}

fn plain_format() -> format::TableFormat {
    format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Dtype, ProblemShape};
    use crate::layout::LayoutTag;
    use crate::select::{select_kernel, KernelKind};

    fn params() -> (TilingParams, PlatformInfo) {
        let platform = PlatformInfo::atlas_a2().with_core_num(2);
        let problem = ProblemShape::new(300, 100, 64).unwrap();
        let params = select_kernel(
            &problem,
            LayoutTag::RowMajor,
            LayoutTag::RowMajor,
            Dtype::Float16,
            &platform,
            Some(KernelKind::Common),
        )
        .unwrap();
        (params, platform)
    }

    #[test]
    fn test_params_table_names_kernel_and_tile() {
        let (params, platform) = params();
        let s = pprint_params_string(&params, &platform);
        assert!(s.contains("Common"));
        assert!(s.contains(&params.l1_tile.to_string()));
    }

    #[test]
    fn test_full_schedule_has_one_row_per_block() {
        let (params, _) = params();
        let s = pprint_schedule_string(&params, SchedulePrintStyle::Full);
        // Title, separator, then a row per block.
        assert_eq!(s.lines().count(), 2 + params.blocks() as usize);
        let compact = pprint_schedule_string(&params, SchedulePrintStyle::Compact);
        assert_eq!(compact.lines().count(), 2 + params.block_dim as usize);
    }
}
