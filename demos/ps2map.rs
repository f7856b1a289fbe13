//! Two-stage demo: a toy CMB power spectrum, then one synthetic sky map per
//! simulation drawn from it.
//!
//! ```sh
//! cargo run --example ps2map -- /tmp/ps2map
//! ```

use std::f64::consts::PI;

use stagecraft::handler::{NumericArray, SkyMap};
use stagecraft::{
    Environment, Executor, HandlerRegistry, PipelineContext, Settings, Stage, StageResult,
    init_logging,
};

const SETTINGS: &str = r#"
context:
  dataset: Demo
  src_root: demos
n_workers: 2
logging:
  enabled: true
  sources: ["{src_root}/*.rs"]
pipeline:
  ps_setup:
    dir_name: PS_Setup
    assets_out:
      cmb_ps: {handler: text_array, path_template: "{root}/{dataset}/{stage}/cmb_ps.txt"}
    make_stage_log: true
  ps2map:
    dir_name: Simulated_Maps
    assets_in:
      cmb_ps: {stage: ps_setup}
    assets_out:
      cmb_map: {handler: sky_map, path_template: "{root}/{dataset}/{stage}/{split}/sim{sim:04}/cmb_map.cbor"}
    splits:
      - {name: Test, n_sims: 2}
      - {name: Valid, n_sims: 1}
    nside: 16
"#;

/// Coefficients of a polynomial in ell roughly tracing D_ell in uK^2.
/// Good enough for a demo and nothing else.
const CHEAP_MODEL: [f64; 9] = [
    1.51935454e-13,
    -1.33044280e-10,
    4.87473463e-08,
    -9.68198860e-06,
    1.12257186e-03,
    -7.62816561e-02,
    3.00276536e+00,
    -4.49411282e+01,
    1.04893659e+03,
];

const LMAX: usize = 200;

struct MakePs {
    stage: Stage,
}

impl MakePs {
    fn new(env: &Environment) -> StageResult<Self> {
        Ok(Self {
            stage: env.stage("ps_setup")?,
        })
    }
}

impl Executor for MakePs {
    fn stage(&self) -> &Stage {
        &self.stage
    }

    fn execute(&mut self) -> StageResult<()> {
        let dl: Vec<f64> = (0..LMAX)
            .map(|ell| {
                CHEAP_MODEL
                    .iter()
                    .fold(0.0, |acc, c| acc * ell as f64 + c)
            })
            .collect();

        self.stage.assets_out.get("cmb_ps")?.write(dl)?;
        Ok(())
    }
}

struct Ps2Map {
    stage: Stage,
    nside: u32,
}

impl Ps2Map {
    fn new(env: &Environment) -> StageResult<Self> {
        let stage = env.stage("ps2map")?;
        let nside = stage.flag("nside")?.unwrap_or(8);
        Ok(Self { stage, nside })
    }
}

/// Converts D_ell to C_ell; the monopole and dipole are dropped.
fn dl_to_cl(dl: &NumericArray) -> Vec<f64> {
    dl.iter()
        .enumerate()
        .map(|(ell, dl)| match ell {
            0 | 1 => 0.0,
            _ => dl * 2.0 * PI / (ell * (ell + 1)) as f64,
        })
        .collect()
}

/// A ring of cosines, one per multipole, phased by the simulation index.
fn synthesize(cl: &[f64], nside: u32, sim: usize) -> anyhow::Result<SkyMap> {
    let Some(mut map) = SkyMap::zeros(nside, 1) else {
        anyhow::bail!("nside {nside} is too large");
    };
    map.unit = Some("uK_CMB".to_string());

    let npix = map.fields[0].len() as f64;
    for (p, pixel) in map.fields[0].iter_mut().enumerate() {
        let theta = 2.0 * PI * p as f64 / npix;
        *pixel = cl
            .iter()
            .enumerate()
            .skip(2)
            .map(|(ell, cl)| cl.max(0.0).sqrt() * (ell as f64 * theta + sim as f64).cos())
            .sum();
    }
    Ok(map)
}

impl Executor for Ps2Map {
    fn stage(&self) -> &Stage {
        &self.stage
    }

    fn execute(&mut self) -> StageResult<()> {
        let dl = self.stage.assets_in.get("cmb_ps")?.read()?.into_array()?;
        let cl = dl_to_cl(&dl);
        let nside = self.nside;

        self.stage
            .par_iterate(self.stage.n_workers(), |stage, key| {
                let map = synthesize(&cl, nside, key.sim.unwrap_or(0))?;
                stage.assets_out.get("cmb_map")?.write(map)?;
                tracing::info!("Wrote map for {key}");
                Ok(())
            })
    }
}

fn main() -> anyhow::Result<()> {
    init_logging();

    let root = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "target/ps2map".to_string());

    let settings = Settings::from_yaml_str(SETTINGS)?
        .with_context("working", format!("{root}/work"))
        .with_context("root", root);

    let mut ctx = PipelineContext::new(settings, HandlerRegistry::with_builtins());
    ctx.add_pipe(MakePs::new).add_pipe(Ps2Map::new);

    ctx.prerun_pipeline()?;
    if let Some(graph) = ctx.graph() {
        println!("{graph}");
    }

    let report = ctx.run_pipeline()?;
    println!("{report}");
    Ok(())
}
