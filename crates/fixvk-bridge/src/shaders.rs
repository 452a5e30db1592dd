//! Built-in fixed-function shader pair, generated per variant and compiled
//! to SPIR-V with naga.

use std::collections::HashMap;
use std::fmt::Write;

use fixvk_protocol::{Driver, GpuHandle};
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::legacy::Fvf;

pub const POSITION_LOCATION: u32 = 0;
pub const COLOR_LOCATION: u32 = 1;
pub const TEXCOORD_LOCATION: u32 = 2;

/// Size of the world·view·projection push constant.
pub const TRANSFORM_PUSH_SIZE: u32 = 64;

/// Which optional inputs a shader pair consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderVariant {
    /// Per-vertex diffuse color
    pub colored: bool,
    /// Stage 0 texture sampled with the first texture coordinate set
    pub textured: bool,
}

impl ShaderVariant {
    pub const ALL: [ShaderVariant; 4] = [
        ShaderVariant {
            colored: false,
            textured: false,
        },
        ShaderVariant {
            colored: true,
            textured: false,
        },
        ShaderVariant {
            colored: false,
            textured: true,
        },
        ShaderVariant {
            colored: true,
            textured: true,
        },
    ];

    /// Texturing needs both coordinates in the vertex and a bound texture.
    pub fn select(fvf: Fvf, texture_bound: bool) -> Self {
        Self {
            colored: fvf.contains(Fvf::DIFFUSE),
            textured: texture_bound && fvf.tex_count() > 0,
        }
    }
}

pub fn vertex_source(variant: ShaderVariant) -> String {
    let mut src = String::new();
    src.push_str("#version 450\n\n");
    let _ = writeln!(
        src,
        "layout(location = {POSITION_LOCATION}) in vec3 a_position;"
    );
    if variant.colored {
        let _ = writeln!(src, "layout(location = {COLOR_LOCATION}) in vec4 a_color;");
    }
    if variant.textured {
        let _ = writeln!(src, "layout(location = {TEXCOORD_LOCATION}) in vec2 a_uv;");
    }
    src.push_str("\nlayout(location = 0) out vec4 v_color;\n");
    if variant.textured {
        src.push_str("layout(location = 1) out vec2 v_uv;\n");
    }
    src.push_str(
        "\nlayout(push_constant) uniform Transform {\n    mat4 wvp;\n} pc;\n\nvoid main() {\n",
    );
    // Row-major rows arrive as GLSL columns, so this is v * WVP.
    src.push_str("    vec4 clip = pc.wvp * vec4(a_position, 1.0);\n");
    src.push_str("    gl_Position = vec4(clip.x, -clip.y, clip.z, clip.w);\n");
    if variant.colored {
        src.push_str("    v_color = a_color;\n");
    } else {
        src.push_str("    v_color = vec4(1.0);\n");
    }
    if variant.textured {
        src.push_str("    v_uv = a_uv;\n");
    }
    src.push_str("}\n");
    src
}

pub fn fragment_source(variant: ShaderVariant) -> String {
    let mut src = String::new();
    src.push_str("#version 450\n\nlayout(location = 0) in vec4 v_color;\n");
    if variant.textured {
        src.push_str("layout(location = 1) in vec2 v_uv;\n\n");
        src.push_str("layout(set = 0, binding = 0) uniform texture2D u_texture;\n");
        src.push_str("layout(set = 0, binding = 1) uniform sampler u_sampler;\n");
    }
    src.push_str("\nlayout(location = 0) out vec4 out_color;\n\nvoid main() {\n");
    if variant.textured {
        src.push_str("    out_color = v_color * texture(sampler2D(u_texture, u_sampler), v_uv);\n");
    } else {
        src.push_str("    out_color = v_color;\n");
    }
    src.push_str("}\n");
    src
}

/// Compile GLSL to SPIR-V words.
pub fn compile(source: &str, stage: naga::ShaderStage) -> Result<Vec<u32>> {
    let module = naga::front::glsl::Frontend::default()
        .parse(&naga::front::glsl::Options::from(stage), source)
        .map_err(|e| BridgeError::PipelineCreationFailed(format!("{stage:?} shader: {e}")))?;

    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| BridgeError::PipelineCreationFailed(format!("{stage:?} shader: {e}")))?;

    let mut options = naga::back::spv::Options {
        lang_version: (1, 0),
        ..Default::default()
    };
    // The vertex shader flips Y itself.
    options
        .flags
        .remove(naga::back::spv::WriterFlags::ADJUST_COORDINATE_SPACE);
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: stage,
        entry_point: "main".to_string(),
    };

    naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
        .map_err(|e| BridgeError::PipelineCreationFailed(format!("{stage:?} shader: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderPair {
    pub vertex: GpuHandle,
    pub fragment: GpuHandle,
}

/// Shader modules, created once per variant for the life of a device.
#[derive(Debug, Default)]
pub struct ShaderLibrary {
    modules: HashMap<ShaderVariant, ShaderPair>,
}

impl ShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create<D: Driver>(
        &mut self,
        driver: &mut D,
        variant: ShaderVariant,
    ) -> Result<ShaderPair> {
        if let Some(pair) = self.modules.get(&variant) {
            return Ok(*pair);
        }
        let vs = compile(&vertex_source(variant), naga::ShaderStage::Vertex)?;
        let fs = compile(&fragment_source(variant), naga::ShaderStage::Fragment)?;
        let vertex = driver
            .create_shader_module(&vs)
            .map_err(|e| BridgeError::PipelineCreationFailed(format!("vertex module: {e}")))?;
        let fragment = match driver.create_shader_module(&fs) {
            Ok(handle) => handle,
            Err(e) => {
                driver.destroy(vertex);
                return Err(BridgeError::PipelineCreationFailed(format!(
                    "fragment module: {e}"
                )));
            }
        };
        debug!(
            colored = variant.colored,
            textured = variant.textured,
            vs_words = vs.len(),
            fs_words = fs.len(),
            "built shader pair"
        );
        let pair = ShaderPair { vertex, fragment };
        self.modules.insert(variant, pair);
        Ok(pair)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn destroy<D: Driver>(&mut self, driver: &mut D) {
        for (_, pair) in self.modules.drain() {
            driver.destroy(pair.fragment);
            driver.destroy(pair.vertex);
        }
    }
}
