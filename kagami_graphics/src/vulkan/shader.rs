//! Shader compilation: GLSL sources ship in the tree and are compiled to
//! SPIR-V at startup with `glslangValidator`, so shader tweaks do not need
//! a build-system round trip.

use std::{fs, path::Path, process::Command, sync::Arc};

use anyhow::{anyhow, Context, Result};

use super::{vk, DeviceShared};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    fn glslang_stage(self) -> &'static str {
        match self {
            Self::Vertex => "vert",
            Self::Fragment => "frag",
        }
    }

    pub(crate) fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

fn compile_glsl_file(source_path: &str, stage: ShaderStage) -> Result<Vec<u8>> {
    let output_path = std::env::temp_dir().join(format!(
        "kagami-{}-{}.spv",
        Path::new(source_path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("shader"),
        stage.glslang_stage(),
    ));

    let status = Command::new("glslangValidator")
        .arg("-V")
        .arg("-S")
        .arg(stage.glslang_stage())
        .arg(source_path)
        .arg("-o")
        .arg(&output_path)
        .status()
        .with_context(|| "failed to run glslangValidator; is it installed?")?;
    if !status.success() {
        return Err(anyhow!("shader compilation failed for {source_path}"));
    }

    let bytes = fs::read(&output_path)
        .with_context(|| format!("failed to read compiled shader {output_path:?}"))?;
    let _ = fs::remove_file(&output_path);
    Ok(bytes)
}

pub struct ShaderModule {
    pub(crate) raw: vk::ShaderModule,
    pub(crate) stage: ShaderStage,
    device: Arc<DeviceShared>,
}

impl ShaderModule {
    pub(crate) fn from_glsl_file(
        device: Arc<DeviceShared>,
        source_path: &str,
        stage: ShaderStage,
    ) -> Result<Self> {
        let bytes = compile_glsl_file(source_path, stage)?;
        if bytes.len() % 4 != 0 {
            return Err(anyhow!("SPIR-V byte length not a multiple of 4"));
        }
        let words = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect::<Vec<_>>();

        let create_info = vk::ShaderModuleCreateInfo::default().code(&words);
        let raw = unsafe { device.raw.create_shader_module(&create_info, None)? };

        Ok(Self { raw, stage, device })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.raw.destroy_shader_module(self.raw, None);
        }
    }
}
