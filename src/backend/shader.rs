// Shader module loading
//
// SPIR-V is compiled by build.rs into the shader directory and read at
// runtime, so shaders can be swapped without rebuilding the binary.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

use super::VulkanDevice;

/// Create a shader module from SPIR-V bytes.
pub fn create_shader_module(device: &VulkanDevice, code: &[u8]) -> Result<vk::ShaderModule> {
    // Copies into u32 words, so `code` needs no particular alignment.
    let words = ash::util::read_spv(&mut Cursor::new(code)).context("Invalid SPIR-V")?;

    let create_info = vk::ShaderModuleCreateInfo::default().code(&words);

    unsafe { device.device.create_shader_module(&create_info, None) }.context("Failed to create shader module")
}

/// Load `<dir>/<name>` and create a shader module from it.
pub fn load_shader_module(device: &VulkanDevice, dir: &Path, name: &str) -> Result<vk::ShaderModule> {
    let path = dir.join(name);
    let code = std::fs::read(&path).with_context(|| format!("Failed to read shader {:?}", path))?;
    log::debug!("Loaded shader {:?} ({} bytes)", path, code.len());
    create_shader_module(device, &code).with_context(|| format!("Shader {:?}", path))
}

#[cfg(test)]
mod tests {
    #[test]
    fn spirv_words_are_read_unaligned() {
        // Magic number, version 1.0, then padding to five words.
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(&0x0723_0203u32.to_le_bytes());
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 12]);

        let words = ash::util::read_spv(&mut std::io::Cursor::new(&bytes[1..])).unwrap();
        assert_eq!(words[0], 0x0723_0203);
        assert_eq!(words.len(), 5);
    }

    #[test]
    fn truncated_spirv_is_rejected() {
        assert!(ash::util::read_spv(&mut std::io::Cursor::new(&[0x03u8, 0x02, 0x23][..])).is_err());
    }
}
