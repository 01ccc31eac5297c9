//! WGSL to SPIR-V compilation through naga

use crate::backend::traits::{BackendError, BackendResult};
use crate::backend::types::{ShaderDesc, ShaderSource, ShaderStage};

/// SPIR-V words for `shader`, compiling WGSL when needed.
pub(super) fn spirv_words(shader: &ShaderDesc) -> BackendResult<Vec<u32>> {
    match &shader.source {
        ShaderSource::SpirV(words) => Ok(words.clone()),
        ShaderSource::Wgsl(source) => compile_wgsl(source, shader.stage, &shader.entry_point),
    }
}

pub(super) fn compile_wgsl(source: &str, stage: ShaderStage, entry_point: &str) -> BackendResult<Vec<u32>> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| {
        BackendError::ShaderCompilationFailed(format!("WGSL parse error: {}", e.emit_to_string(source)))
    })?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    let info = validator
        .validate(&module)
        .map_err(|e| BackendError::ShaderCompilationFailed(format!("Validation error: {e}")))?;

    let naga_stage = match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Fragment => naga::ShaderStage::Fragment,
        ShaderStage::Compute => naga::ShaderStage::Compute,
    };
    if !module
        .entry_points
        .iter()
        .any(|ep| ep.name == entry_point && ep.stage == naga_stage)
    {
        return Err(BackendError::ShaderCompilationFailed(format!(
            "Entry point '{}' not found for stage {:?}",
            entry_point, stage
        )));
    }

    let options = naga::back::spv::Options {
        lang_version: (1, 3),
        ..Default::default()
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: naga_stage,
        entry_point: entry_point.to_string(),
    };

    naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
        .map_err(|e| BackendError::ShaderCompilationFailed(format!("SPIR-V generation error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILL: &str = r#"
@group(0) @binding(0) var target: texture_storage_2d<rgba16float, write>;

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    textureStore(target, vec2<i32>(id.xy), vec4<f32>(1.0, 0.0, 0.0, 1.0));
}
"#;

    #[test]
    fn test_compile_compute_shader() {
        let words = compile_wgsl(FILL, ShaderStage::Compute, "main").unwrap();
        assert_eq!(words[0], 0x0723_0203);
    }

    #[test]
    fn test_missing_entry_point() {
        let result = compile_wgsl(FILL, ShaderStage::Vertex, "main");
        assert!(matches!(result, Err(BackendError::ShaderCompilationFailed(_))));
    }

    #[test]
    fn test_parse_error() {
        let result = compile_wgsl("fn main( {", ShaderStage::Compute, "main");
        assert!(matches!(result, Err(BackendError::ShaderCompilationFailed(_))));
    }
}
