//! C11 — PBR material storage and GPU upload, content-addressed through
//! the ref-counting registry (C3) so two meshes referencing the same
//! material definition share one descriptor set and one set of textures.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::allocator::{AllocatedImage, DeviceAllocator};
use crate::error::{AllocatorError, RendererError};
use crate::pipeline::descriptor::DescriptorLayouts;
use crate::registry::RefRegistry;

/// Which of the five combined-image-sampler bindings a texture occupies
/// (spec §4.11, mirrors [`crate::pipeline::descriptor::DescriptorLayouts`]).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TextureSlot {
    BaseColor = 0,
    MetallicRoughness = 1,
    Normal = 2,
    Occlusion = 3,
    Emissive = 4,
}

/// Raw pixel data for one texture slot, already decoded. Importing image
/// formats from disk is out of scope (spec non-goals); callers hand in
/// already-decoded RGBA8 bytes.
#[derive(Clone)]
pub struct TextureSource {
    pub slot: TextureSlot,
    pub width: u32,
    pub height: u32,
    pub rgba8: Vec<u8>,
}

/// Scalar factors and texture sources that together identify a unique
/// material (spec §4.11 "Material description").
#[derive(Clone)]
pub struct MaterialDescription {
    pub identifier: String,
    pub base_color_factor: [f32; 4],
    pub metallic_factor: f32,
    pub roughness_factor: f32,
    pub textures: Vec<TextureSource>,
}

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl MaterialDescription {
    /// Derives a content-addressed identifier from the scalar factors and
    /// the texture payloads, so that two callers who independently build
    /// the same material end up sharing one registry entry without having
    /// agreed on a name ahead of time (spec §3/§4.11 "material identity").
    /// This is a 192-bit triple — texture hash, factor hash, and a
    /// transform hash reserved for future per-texture UV transforms — laid
    /// out as three hex-encoded u64s, matching the shape
    /// `original_source/`'s material cache key used.
    pub fn content_hash(&self) -> String {
        let mut texture_bytes = Vec::new();
        for texture in &self.textures {
            texture_bytes.push(texture.slot as u8);
            texture_bytes.extend_from_slice(&texture.width.to_le_bytes());
            texture_bytes.extend_from_slice(&texture.height.to_le_bytes());
            texture_bytes.extend_from_slice(&texture.rgba8);
        }
        let texture_hash = fnv1a(&texture_bytes);

        let mut factor_bytes = Vec::new();
        for f in self.base_color_factor {
            factor_bytes.extend_from_slice(&f.to_bits().to_le_bytes());
        }
        factor_bytes.extend_from_slice(&self.metallic_factor.to_bits().to_le_bytes());
        factor_bytes.extend_from_slice(&self.roughness_factor.to_bits().to_le_bytes());
        let factor_hash = fnv1a(&factor_bytes);

        // No per-texture UV transforms are modeled yet; the reserved third
        // component is a fixed value rather than omitted, so the key shape
        // stays stable if transforms are added later.
        let transform_hash: u64 = 0;

        format!("{texture_hash:016x}{factor_hash:016x}{transform_hash:016x}")
    }
}

struct GpuTexture {
    image: AllocatedImage,
    view: vk::ImageView,
    sampler: vk::Sampler,
}

/// The GPU-resident form of a material: one descriptor set plus its
/// backing textures. Slots without a supplied texture fall back to a
/// shared 1x1 default (flat normal for [`TextureSlot::Normal`], opaque
/// white otherwise) so every binding in the descriptor set is always
/// written — an unwritten `COMBINED_IMAGE_SAMPLER` binding is undefined
/// behavior to sample from (open question resolved in favor of safety
/// over a "missing texture" error path).
pub struct GpuMaterial {
    pub base_color_factor: [f32; 4],
    pub metallic_factor: f32,
    pub roughness_factor: f32,
    pub descriptor_set: vk::DescriptorSet,
    textures: Vec<GpuTexture>,
}

pub type MaterialRegistry = RefRegistry<GpuMaterial>;

unsafe fn upload_texture(
    device: &ash::Device,
    allocator: &DeviceAllocator,
    width: u32,
    height: u32,
    rgba8: &[u8],
    name: &str,
    max_anisotropy: Option<f32>,
) -> Result<GpuTexture, AllocatorError> {
    let create_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(vk::Format::R8G8B8A8_UNORM)
        .extent(vk::Extent3D { width, height, depth: 1 })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = allocator.create_image(device, &create_info, MemoryLocation::GpuOnly, name)?;

    debug_assert_eq!(rgba8.len() as u64, u64::from(width) * u64::from(height) * 4);

    let view_info = vk::ImageViewCreateInfo::default()
        .image(image.handle)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(vk::Format::R8G8B8A8_UNORM)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    let view = device
        .create_image_view(&view_info, None)
        .map_err(AllocatorError::CreateFailed)?;

    let mut sampler_info = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .max_lod(1.0);
    if let Some(max_anisotropy) = max_anisotropy {
        sampler_info = sampler_info.anisotropy_enable(true).max_anisotropy(max_anisotropy);
    }
    let sampler = device
        .create_sampler(&sampler_info, None)
        .map_err(AllocatorError::CreateFailed)?;

    Ok(GpuTexture { image, view, sampler })
}

fn default_pixels(slot: TextureSlot) -> [u8; 4] {
    match slot {
        TextureSlot::Normal => [128, 128, 255, 255],
        TextureSlot::MetallicRoughness => [0, 255, 0, 255],
        _ => [255, 255, 255, 255],
    }
}

/// Uploads textures, allocates a descriptor set, and writes every binding
/// (spec §4.11 "material upload").
///
/// # Safety
/// `device`/`allocator`/`layouts` must all belong to the same
/// [`crate::device::DeviceContext`].
pub unsafe fn upload_material(
    device: &ash::Device,
    allocator: &DeviceAllocator,
    layouts: &DescriptorLayouts,
    description: &MaterialDescription,
    max_anisotropy: Option<f32>,
) -> Result<GpuMaterial, RendererError> {
    const SLOT_ORDER: [TextureSlot; 5] = [
        TextureSlot::BaseColor,
        TextureSlot::MetallicRoughness,
        TextureSlot::Normal,
        TextureSlot::Occlusion,
        TextureSlot::Emissive,
    ];

    let mut textures = Vec::with_capacity(5);
    for slot in SLOT_ORDER {
        let source = description.textures.iter().find(|t| t.slot == slot);
        let texture = match source {
            Some(src) => upload_texture(
                device,
                allocator,
                src.width,
                src.height,
                &src.rgba8,
                &description.identifier,
                max_anisotropy,
            ),
            None => {
                let pixel = default_pixels(slot);
                upload_texture(device, allocator, 1, 1, &pixel, "default-texture", max_anisotropy)
            }
        };
        match texture {
            Ok(t) => textures.push(t),
            Err(e) => {
                for t in textures {
                    device.destroy_sampler(t.sampler, None);
                    device.destroy_image_view(t.view, None);
                    allocator.free_image(device, t.image);
                }
                return Err(RendererError::Allocator(e));
            }
        }
    }

    let descriptor_set = layouts
        .allocate_material_set(device)
        .map_err(RendererError::Allocator)?;

    let image_infos: Vec<_> = textures
        .iter()
        .map(|t| {
            vk::DescriptorImageInfo::default()
                .image_view(t.view)
                .sampler(t.sampler)
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        })
        .collect();
    let writes: Vec<_> = image_infos
        .iter()
        .enumerate()
        .map(|(binding, info)| {
            vk::WriteDescriptorSet::default()
                .dst_set(descriptor_set)
                .dst_binding(binding as u32)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(std::slice::from_ref(info))
        })
        .collect();
    device.update_descriptor_sets(&writes, &[]);

    Ok(GpuMaterial {
        base_color_factor: description.base_color_factor,
        metallic_factor: description.metallic_factor,
        roughness_factor: description.roughness_factor,
        descriptor_set,
        textures,
    })
}

/// # Safety
/// `device`/`allocator` must be the ones the material's textures were
/// uploaded with, and the material must not be in use by any in-flight
/// command.
pub unsafe fn destroy_material(device: &ash::Device, allocator: &DeviceAllocator, material: GpuMaterial) {
    for texture in material.textures {
        device.destroy_sampler(texture.sampler, None);
        device.destroy_image_view(texture.view, None);
        allocator.free_image(device, texture.image);
    }
}

/// Convenience for callers sharing a registry across threads.
pub type SharedMaterialRegistry = Arc<MaterialRegistry>;
