//! Link-list neighbour search
//!
//! Given particle positions, produce the per-particle cell index
//! (`icell`), the head-of-cell table (`ihoc`), and a cell-sorted
//! particle order. One execute runs, in order:
//!
//! 1. min/max position reductions (host-joined),
//! 2. cell-grid sizing and, when the grid grew, reallocation of `ihoc`,
//! 3. the `iCell` kernel over the padded particle count,
//! 4. a radix sort of `icell`,
//! 5. the `iHoc` reset kernel over the cell capacity,
//! 6. the `linkList` head-recording kernel over the particle count.
//!
//! `ihoc` is declared reallocatable; later readers observe the swapped
//! buffer because arguments resolve through the registry.

use crate::error::{Error, Result};
use crate::scalar::{ScalarValue, VarType};
use crate::server::CalcServer;
use crate::tool::{self, Tool, ToolMeta};
use crate::tools::{RadixSort, Reduction, ShadowArgs};
use crate::variables::Variable;
use riptide_backends::{wait_all, Device, Event, Kernel, NdRange};
use std::sync::Arc;

const LINKLIST_SRC: &str = r#"
__kernel void iHoc(__global unsigned int* ihoc, unsigned int N, uivec4 n_cells);
__kernel void iCell(__global unsigned int* icell, __global const vec* r,
                    unsigned int N, unsigned int n_radix, vec r_min,
                    float support, float h, uivec4 n_cells);
__kernel void linkList(__global const unsigned int* icell,
                       __global unsigned int* ihoc, unsigned int N);
"#;

const IHOC_ARGS: [&str; 3] = ["ihoc", "N", "n_cells"];
const LINKLIST_ARGS: [&str; 3] = ["icell", "ihoc", "N"];

struct Stage {
    kernel: Kernel,
    shadow: ShadowArgs,
    local: usize,
}

impl Stage {
    fn new(kernel: Kernel) -> Self {
        let local = kernel.max_work_group_size();
        Self {
            shadow: ShadowArgs::new(kernel.params().len()),
            kernel,
            local,
        }
    }
}

/// Cell-bucketed neighbour search over a position array
pub struct LinkList {
    meta: ToolMeta,
    input_name: String,
    min_pos: Reduction,
    max_pos: Reduction,
    sort: RadixSort,
    icell_stage: Option<Stage>,
    ihoc_stage: Option<Stage>,
    link_stage: Option<Stage>,
    cell_length: f32,
    substage_cells: usize,
    substage_icell: usize,
    substage_link: usize,
}

impl LinkList {
    /// Neighbour search over the position variable `input`
    pub fn new(name: &str, input: &str, once: bool) -> Self {
        let mut meta = ToolMeta::new(name, once);
        let substage_cells = meta.add_substage("n_cells");
        let substage_icell = meta.add_substage("icell");
        let substage_link = meta.add_substage("ihoc + link-list");
        Self {
            meta,
            input_name: input.to_string(),
            min_pos: Reduction::new(
                &format!("{name}->Min. Pos."),
                input,
                "r_min",
                "c = min(a, b);",
                "VEC_INFINITY",
            ),
            max_pos: Reduction::new(
                &format!("{name}->Max. Pos."),
                input,
                "r_max",
                "c = max(a, b);",
                "-VEC_INFINITY",
            ),
            sort: RadixSort::new(&format!("{name}->Radix-Sort"), "icell", "id_unsorted", "id_sorted"),
            icell_stage: None,
            ihoc_stage: None,
            link_stage: None,
            cell_length: 0.0,
            substage_cells,
            substage_icell,
            substage_link,
        }
    }

    /// Compute the cell grid for the current bounding box
    fn cell_grid(&self, server: &Arc<CalcServer>) -> Result<[u32; 4]> {
        if self.cell_length <= 0.0 {
            return Err(Error::bad_expression(
                "support * h",
                format!("zero cell length in tool \"{}\"", self.meta.name()),
            ));
        }
        let vars = server.variables();
        let r_min = vars.require("r_min")?.scalar()?;
        let r_max = vars.require("r_max")?.scalar()?;

        let cells = |axis: usize| ((r_max.component(axis) - r_min.component(axis)) / self.cell_length as f64) as u32 + 6;
        let nx = cells(0);
        let ny = cells(1);
        let nz = if vars.dims() == 3 { cells(2) } else { 1 };
        Ok([nx, ny, nz, nx * ny * nz])
    }

    /// Grow `ihoc` when the grid no longer fits, otherwise update only
    /// the axis components (capacity stays in `n_cells.w`)
    fn allocate(&mut self, server: &Arc<CalcServer>, grid: [u32; 4]) -> Result<()> {
        let vars = server.variables();
        let n_cells = vars.require("n_cells")?;
        if n_cells.var_type() != VarType::parse("uivec4", vars.dims())? {
            return Err(Error::bad_var_type("n_cells", "uivec4", n_cells.var_type()));
        }
        let current = n_cells.scalar()?;
        let capacity = match current {
            ScalarValue::UIVec(data, _) => data[3],
            _ => 0,
        };

        if grid[3] <= capacity {
            n_cells.set_scalar(ScalarValue::UIVec([grid[0], grid[1], grid[2], capacity], 4))?;
            vars.populate(&n_cells)?;
            return Ok(());
        }

        // The grid outgrew the table: swap the ihoc buffer. Outstanding
        // users were host-joined through the reduction waits, so the swap
        // is safe here.
        let ihoc = vars.require("ihoc")?;
        let device = server.context().device();
        let old_bytes = ihoc.len()? * 4;
        device.free_buffer(ihoc.buffer()?)?;
        self.meta.sub_allocated(old_bytes);

        let new_len = grid[3] as usize;
        let buffer = device.allocate_buffer(new_len * 4)?;
        self.meta.add_allocated(new_len * 4);
        ihoc.set_buffer(buffer, new_len)?;

        n_cells.set_scalar(ScalarValue::UIVec(grid, 4))?;
        vars.populate(&n_cells)?;
        tracing::debug!(tool = self.meta.name(), cells = grid[3], "ihoc reallocated");
        Ok(())
    }

    fn bind_stage(server: &Arc<CalcServer>, stage: &mut Stage, names: &[&str]) -> Result<()> {
        let vars = server.variables();
        for (index, name) in names.iter().enumerate() {
            let variable = vars.require(name)?;
            stage.shadow.bind_var(&mut stage.kernel, index, &variable)?;
        }
        Ok(())
    }
}

impl Tool for LinkList {
    fn meta(&self) -> &ToolMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ToolMeta {
        &mut self.meta
    }

    fn setup(&mut self, server: &Arc<CalcServer>) -> Result<()> {
        let ctx = server.context();
        let vars = server.variables();

        self.min_pos.setup(server)?;
        self.max_pos.setup(server)?;

        self.cell_length =
            (vars.require("support")?.scalar()?.component(0) * vars.require("h")?.scalar()?.component(0)) as f32;

        let options = ctx.build_options();
        self.ihoc_stage = Some(Stage::new(ctx.compile_kernel(LINKLIST_SRC, "iHoc", options.clone())?));
        self.icell_stage = Some(Stage::new(ctx.compile_kernel(LINKLIST_SRC, "iCell", options.clone())?));
        self.link_stage = Some(Stage::new(ctx.compile_kernel(LINKLIST_SRC, "linkList", options)?));

        self.sort.setup(server)?;

        let inputs = [self.input_name.as_str(), "N", "n_radix", "support", "h"]
            .iter()
            .map(|name| vars.require(name))
            .collect::<Result<Vec<_>>>()?;
        let outputs = ["r_min", "r_max", "ihoc", "icell", "n_cells"]
            .iter()
            .map(|name| vars.require(name))
            .collect::<Result<Vec<_>>>()?;
        for output in &outputs {
            if output.name() == "icell" {
                let expected = VarType::parse("unsigned int*", vars.dims())?;
                if output.var_type() != expected {
                    return Err(Error::bad_var_type("icell", "unsigned int*", output.var_type()));
                }
            }
        }
        self.meta.set_dependencies(inputs, outputs);

        // This tool owns ihoc's storage lifecycle.
        vars.require("ihoc")?.set_reallocatable(true);
        Ok(())
    }

    fn launch(&mut self, server: &Arc<CalcServer>, wait: &[Event]) -> Result<Option<Event>> {
        let vars = server.variables();
        let queue = server.context().queue();

        // Bounding-box reductions; the grid sizing below needs their
        // results on the host, so this is a genuine suspension point.
        tool::execute(&mut self.min_pos, server)?;
        tool::execute(&mut self.max_pos, server)?;
        let join: Vec<Event> = [vars.require("r_min")?, vars.require("r_max")?]
            .iter()
            .filter_map(|v| v.writing_event())
            .collect();
        wait_all(&join).map_err(Error::Accelerator)?;

        let cells_started = std::time::Instant::now();
        let grid = self.cell_grid(server)?;
        self.allocate(server, grid)?;
        self.meta
            .substage_mut(self.substage_cells)
            .record(cells_started.elapsed().as_secs_f64());

        let n = vars.require("N")?.scalar()?.as_u32().unwrap_or(0) as usize;
        let n_radix = vars.require("n_radix")?.scalar()?.as_u32().unwrap_or(0) as usize;
        let n_cells_total = match vars.require("n_cells")?.scalar()? {
            ScalarValue::UIVec(data, _) => data[3] as usize,
            _ => 0,
        };

        // Cell assignment over the padded particle count.
        let icell_started = std::time::Instant::now();
        let icell_event = {
            let stage = self.icell_stage.as_mut().ok_or_else(|| Error::InvalidVariable("iCell".into()))?;
            let args = [
                "icell",
                self.input_name.as_str(),
                "N",
                "n_radix",
                "r_min",
                "support",
                "h",
                "n_cells",
            ];
            Self::bind_stage(server, stage, &args)?;
            let range = NdRange::new(n_radix.max(1), stage.local)?;
            queue.enqueue_kernel(&stage.kernel, range, wait)?
        };
        let icell = vars.require("icell")?;
        icell.set_writing_event(icell_event.clone());
        vars.require("n_cells")?.add_reading_event(icell_event);
        self.meta
            .substage_mut(self.substage_icell)
            .record(icell_started.elapsed().as_secs_f64());

        // Bucket the particles; the sort publishes fresh events on icell
        // and the permutation arrays.
        tool::execute(&mut self.sort, server)?;
        let sorted_event = icell
            .writing_event()
            .ok_or_else(|| Error::InvalidVariable("icell".into()))?;

        let link_started = std::time::Instant::now();
        let ihoc_event = {
            let stage = self.ihoc_stage.as_mut().ok_or_else(|| Error::InvalidVariable("iHoc".into()))?;
            Self::bind_stage(server, stage, &IHOC_ARGS)?;
            let range = NdRange::new(n_cells_total.max(1), stage.local)?;
            queue.enqueue_kernel(&stage.kernel, range, &[sorted_event])?
        };

        let out_event = {
            let stage = self.link_stage.as_mut().ok_or_else(|| Error::InvalidVariable("linkList".into()))?;
            Self::bind_stage(server, stage, &LINKLIST_ARGS)?;
            let range = NdRange::new(n.max(1), stage.local)?;
            queue.enqueue_kernel(&stage.kernel, range, &[ihoc_event])?
        };
        self.meta
            .substage_mut(self.substage_link)
            .record(link_started.elapsed().as_secs_f64());

        Ok(Some(out_event))
    }
}
