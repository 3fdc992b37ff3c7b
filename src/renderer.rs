//! wgpu Renderer module
//!
//! Implements [`GpuSurface`] on top of wgpu: multisampled eye targets with
//! depth, single-sample resolve textures the compositor and the lens pass
//! both read, and the companion window the distortion mesh is drawn into.

use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use log::{debug, info, warn};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use wgpu::util::DeviceExt;
use wgpu::{
    Adapter, BindGroup, BindGroupLayout, Buffer, Device, DeviceDescriptor, Instance,
    InstanceDescriptor, Queue, RenderPipeline, Sampler, Surface, SurfaceConfiguration,
    SurfaceTargetUnsafe, SurfaceTexture, TextureFormat, TextureUsages, TextureView,
};
use winit::window::Window;

use crate::config::AppConfig;
use crate::distortion::DistortionMesh;
use crate::error::{AssetLoadError, FramebufferError, SessionInitError};
use crate::gpu::{
    AxisVertex, DistortionVertex, DrawCall, EyePass, EyeTarget, GpuModel, GpuSurface, MeshHandle,
    SceneVertex, TargetHandle, TextureHandle,
};
use crate::runtime::{Eye, RenderModelData, RenderModelVertex, TextureMapData};
use crate::scene::AXIS_VERTICES_PER_CONTROLLER;

const EYE_COLOR_FORMAT: TextureFormat = TextureFormat::Rgba8UnormSrgb;
const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth24Plus;
const TEXTURE_FORMAT: TextureFormat = TextureFormat::Rgba8UnormSrgb;

/// Scene, controller lines, and one draw per tracked device.
const MAX_DRAWS_PER_EYE: usize = 80;
const MAX_AXIS_VERTICES: usize = 16 * AXIS_VERTICES_PER_CONTROLLER;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct DrawUniforms {
    mvp: [[f32; 4]; 4],
}

/// One `DrawUniforms` per draw, each at the start of a `stride`-sized slot
/// so the draws can be selected with dynamic offsets.
fn pack_draw_uniforms(draws: &[DrawCall], stride: usize) -> Vec<u8> {
    let mut uniforms = vec![0u8; stride * draws.len()];
    for (slot, draw) in draws.iter().enumerate() {
        let mvp = match draw {
            DrawCall::Scene { mvp } => *mvp,
            DrawCall::ControllerAxes { view_projection, .. } => *view_projection,
            DrawCall::RenderModel { mvp, .. } => *mvp,
        };
        let start = slot * stride;
        let draw_uniforms = DrawUniforms {
            mvp: mvp.to_cols_array_2d(),
        };
        let bytes = bytemuck::bytes_of(&draw_uniforms);
        uniforms[start..start + bytes.len()].copy_from_slice(bytes);
    }
    uniforms
}

struct GpuMesh {
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    index_count: u32,
}

struct GpuTexture {
    #[allow(dead_code)]
    texture: wgpu::Texture,
    bind_group: BindGroup,
}

struct SceneResources {
    vertex_buffer: Buffer,
    vertex_count: u32,
    texture: GpuTexture,
}

/// Views for one eye. With a single sample the resolve texture is rendered
/// into directly and `msaa_view` is `None`.
struct TargetResources {
    msaa_view: Option<TextureView>,
    depth_view: TextureView,
    resolved_view: TextureView,
    resolved: TextureHandle,
}

struct EyePipelines {
    samples: u32,
    scene: RenderPipeline,
    axes: RenderPipeline,
    render_model: RenderPipeline,
}

pub struct WgpuSurface {
    // the surface borrows the window's native handle, so it is dropped first
    surface: Surface<'static>,
    window: Arc<Window>,
    adapter: Adapter,
    device: Device,
    queue: Queue,
    config: SurfaceConfiguration,

    uniform_buffer: Buffer,
    uniform_stride: u64,
    uniform_bind_group: BindGroup,
    uniform_bind_group_layout: BindGroupLayout,
    texture_bind_group_layout: BindGroupLayout,
    sampler: Sampler,

    eye_pipelines: Option<EyePipelines>,
    distortion_pipeline: RenderPipeline,

    scene: Option<SceneResources>,
    axes_buffer: Buffer,
    meshes: HashMap<u32, GpuMesh>,
    textures: HashMap<u64, GpuTexture>,
    targets: HashMap<u32, TargetResources>,
    next_id: u32,

    pending_frame: Option<SurfaceTexture>,
}

fn gpu_error(what: &str, e: impl std::fmt::Display) -> SessionInitError {
    SessionInitError::Gpu(format!("{}: {}", what, e))
}

impl WgpuSurface {
    pub async fn new(window: Arc<Window>, app_config: &AppConfig) -> Result<Self, SessionInitError> {
        let size = window.inner_size();

        let instance = Instance::new(&InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            flags: if app_config.gpu_debug {
                wgpu::InstanceFlags::debugging()
            } else {
                wgpu::InstanceFlags::empty()
            },
            ..Default::default()
        });

        let window_handle = window
            .window_handle()
            .map_err(|e| gpu_error("no window handle", e))?
            .as_raw();
        let display_handle = window
            .display_handle()
            .map_err(|e| gpu_error("no display handle", e))?
            .as_raw();
        // SAFETY: `window` is stored next to the surface and outlives it.
        let surface = unsafe {
            instance.create_surface_unsafe(SurfaceTargetUnsafe::RawHandle {
                raw_display_handle: display_handle,
                raw_window_handle: window_handle,
            })
        }
        .map_err(|e| gpu_error("unable to create surface", e))?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| SessionInitError::Gpu("no compatible GPU adapter".to_string()))?;
        let info = adapter.get_info();
        info!("GPU adapter: {} ({:?})", info.name, info.backend);

        // beyond 1x/4x, sample counts depend on the adapter
        let required_features =
            adapter.features() & wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES;
        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: Some("VR Device"),
                    required_features,
                    ..Default::default()
                },
                None,
            )
            .await
            .map_err(|e| gpu_error("unable to create device", e))?;

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .copied()
            .find(TextureFormat::is_srgb)
            .or_else(|| surface_caps.formats.first().copied())
            .ok_or_else(|| SessionInitError::Gpu("surface reports no formats".to_string()))?;
        let alpha_mode = surface_caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: if app_config.vblank {
                wgpu::PresentMode::Fifo
            } else {
                wgpu::PresentMode::AutoNoVsync
            },
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        // Uniforms: one 64-byte matrix per draw, at dynamic offsets
        let alignment = u64::from(device.limits().min_uniform_buffer_offset_alignment);
        let uniform_size = std::mem::size_of::<DrawUniforms>() as u64;
        let uniform_stride = uniform_size.div_ceil(alignment) * alignment;
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Draw Uniform Buffer"),
            size: uniform_stride * MAX_DRAWS_PER_EYE as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let uniform_bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Draw Uniform Bind Group Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: wgpu::BufferSize::new(uniform_size),
                },
                count: None,
            }],
        });

        let uniform_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Draw Uniform Bind Group"),
            layout: &uniform_bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &uniform_buffer,
                    offset: 0,
                    size: wgpu::BufferSize::new(uniform_size),
                }),
            }],
        });

        let texture_bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Texture Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Clamped Linear Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let distortion_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Distortion Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/distortion.wgsl").into()),
        });
        let distortion_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Distortion Pipeline Layout"),
            bind_group_layouts: &[&texture_bind_group_layout],
            push_constant_ranges: &[],
        });
        let distortion_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Distortion Pipeline"),
            layout: Some(&distortion_pipeline_layout),
            vertex: wgpu::VertexState {
                module: &distortion_shader,
                entry_point: Some("vs_main"),
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: std::mem::size_of::<DistortionVertex>() as u64,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &wgpu::vertex_attr_array![
                        0 => Float32x2, 1 => Float32x2, 2 => Float32x2, 3 => Float32x2
                    ],
                }],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &distortion_shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let axes_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Controller Axes Buffer"),
            size: (MAX_AXIS_VERTICES * std::mem::size_of::<AxisVertex>()) as u64,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Ok(Self {
            surface,
            window,
            adapter,
            device,
            queue,
            config,
            uniform_buffer,
            uniform_stride,
            uniform_bind_group,
            uniform_bind_group_layout,
            texture_bind_group_layout,
            sampler,
            eye_pipelines: None,
            distortion_pipeline,
            scene: None,
            axes_buffer,
            meshes: HashMap::new(),
            textures: HashMap::new(),
            targets: HashMap::new(),
            next_id: 0,
            pending_frame: None,
        })
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.config.width = width;
            self.config.height = height;
            self.surface.configure(&self.device, &self.config);
        }
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn supports_samples(&self, format: TextureFormat, samples: u32) -> bool {
        if samples == 1 {
            return true;
        }
        if self
            .device
            .features()
            .contains(wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES)
        {
            self.adapter
                .get_texture_format_features(format)
                .flags
                .sample_count_supported(samples)
        } else {
            samples == 4
        }
    }

    fn build_eye_pipelines(&self, samples: u32) -> EyePipelines {
        let textured_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Textured Pipeline Layout"),
            bind_group_layouts: &[&self.uniform_bind_group_layout, &self.texture_bind_group_layout],
            push_constant_ranges: &[],
        });
        let axes_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Controller Axes Pipeline Layout"),
            bind_group_layouts: &[&self.uniform_bind_group_layout],
            push_constant_ranges: &[],
        });

        let scene_shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Scene Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/scene.wgsl").into()),
        });
        let axes_shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Controller Axes Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/axes.wgsl").into()),
        });
        let model_shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Render Model Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/render_model.wgsl").into()),
        });

        EyePipelines {
            samples,
            scene: self.eye_pipeline(
                "Scene Pipeline",
                &scene_shader,
                &textured_layout,
                wgpu::VertexBufferLayout {
                    array_stride: std::mem::size_of::<SceneVertex>() as u64,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x2],
                },
                wgpu::PrimitiveTopology::TriangleList,
                samples,
            ),
            axes: self.eye_pipeline(
                "Controller Axes Pipeline",
                &axes_shader,
                &axes_layout,
                wgpu::VertexBufferLayout {
                    array_stride: std::mem::size_of::<AxisVertex>() as u64,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3],
                },
                wgpu::PrimitiveTopology::LineList,
                samples,
            ),
            render_model: self.eye_pipeline(
                "Render Model Pipeline",
                &model_shader,
                &textured_layout,
                wgpu::VertexBufferLayout {
                    array_stride: std::mem::size_of::<RenderModelVertex>() as u64,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &wgpu::vertex_attr_array![
                        0 => Float32x3, 1 => Float32x3, 2 => Float32x2
                    ],
                },
                wgpu::PrimitiveTopology::TriangleList,
                samples,
            ),
        }
    }

    fn eye_pipeline(
        &self,
        label: &str,
        shader: &wgpu::ShaderModule,
        layout: &wgpu::PipelineLayout,
        vertex_layout: wgpu::VertexBufferLayout<'_>,
        topology: wgpu::PrimitiveTopology,
        samples: u32,
    ) -> RenderPipeline {
        self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(label),
            layout: Some(layout),
            vertex: wgpu::VertexState {
                module: shader,
                entry_point: Some("vs_main"),
                buffers: &[vertex_layout],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: EYE_COLOR_FORMAT,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology,
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState {
                count: samples,
                ..Default::default()
            },
            multiview: None,
            cache: None,
        })
    }

    fn create_texture(&mut self, label: &str, data: &TextureMapData) -> Result<GpuTexture, String> {
        let expected = data.width as usize * data.height as usize * 4;
        if data.width == 0 || data.height == 0 || data.rgba.len() != expected {
            return Err(format!(
                "texture is {}x{} but carries {} bytes",
                data.width,
                data.height,
                data.rgba.len()
            ));
        }
        let max = self.device.limits().max_texture_dimension_2d;
        if data.width > max || data.height > max {
            return Err(format!("texture {}x{} exceeds limit {}", data.width, data.height, max));
        }

        let size = wgpu::Extent3d {
            width: data.width,
            height: data.height,
            depth_or_array_layers: 1,
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TEXTURE_FORMAT,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &[],
        });
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &data.rgba,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(data.width * 4),
                rows_per_image: Some(data.height),
            },
            size,
        );
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = self.texture_bind_group(label, &view);
        Ok(GpuTexture { texture, bind_group })
    }

    fn texture_bind_group(&self, label: &str, view: &TextureView) -> BindGroup {
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &self.texture_bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(view) },
                wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::Sampler(&self.sampler) },
            ],
        })
    }

    fn eye_attachment_texture(
        &self,
        label: &str,
        width: u32,
        height: u32,
        samples: u32,
        format: TextureFormat,
        usage: TextureUsages,
    ) -> wgpu::Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: samples,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        })
    }
}

impl GpuSurface for WgpuSurface {
    fn create_eye_target(
        &mut self,
        eye: Eye,
        width: u32,
        height: u32,
        samples: u32,
    ) -> Result<EyeTarget, FramebufferError> {
        let max = self.device.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(FramebufferError::InvalidSize { width, height, max });
        }
        if !self.supports_samples(EYE_COLOR_FORMAT, samples) || !self.supports_samples(DEPTH_FORMAT, samples) {
            return Err(FramebufferError::UnsupportedSampleCount { samples });
        }

        if self.eye_pipelines.as_ref().map(|p| p.samples) != Some(samples) {
            self.eye_pipelines = Some(self.build_eye_pipelines(samples));
        }

        let label = format!("{:?} Eye", eye);
        let depth = self.eye_attachment_texture(
            &format!("{} Depth", label),
            width,
            height,
            samples,
            DEPTH_FORMAT,
            TextureUsages::RENDER_ATTACHMENT,
        );
        let msaa = (samples > 1).then(|| {
            self.eye_attachment_texture(
                &format!("{} Multisample Color", label),
                width,
                height,
                samples,
                EYE_COLOR_FORMAT,
                TextureUsages::RENDER_ATTACHMENT,
            )
        });
        let resolved = self.eye_attachment_texture(
            &format!("{} Resolve", label),
            width,
            height,
            1,
            EYE_COLOR_FORMAT,
            TextureUsages::RENDER_ATTACHMENT | TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_SRC,
        );
        let resolved_view = resolved.create_view(&wgpu::TextureViewDescriptor::default());

        let texture_id = u64::from(self.next_id());
        let bind_group = self.texture_bind_group(&format!("{} Resolve Bind Group", label), &resolved_view);
        self.textures.insert(
            texture_id,
            GpuTexture {
                texture: resolved,
                bind_group,
            },
        );

        let target_id = self.next_id();
        self.targets.insert(
            target_id,
            TargetResources {
                msaa_view: msaa.map(|t| t.create_view(&wgpu::TextureViewDescriptor::default())),
                depth_view: depth.create_view(&wgpu::TextureViewDescriptor::default()),
                resolved_view,
                resolved: TextureHandle(texture_id),
            },
        );
        debug!("Created {} target {}x{} ({} samples)", label, width, height, samples);

        Ok(EyeTarget {
            eye,
            width,
            height,
            samples,
            target: TargetHandle(target_id),
            resolved: TextureHandle(texture_id),
        })
    }

    fn upload_scene(&mut self, vertices: &[SceneVertex], texture: &TextureMapData) {
        let texture = match self.create_texture("Scene Texture", texture) {
            Ok(texture) => texture,
            Err(e) => {
                warn!("Scene texture rejected, cubes disabled: {}", e);
                return;
            }
        };
        if vertices.is_empty() {
            return;
        }
        let size = std::mem::size_of_val(vertices) as u64;
        let max = self.device.limits().max_buffer_size;
        if size > max || u32::try_from(vertices.len()).is_err() {
            warn!("Scene needs {} bytes of vertices (limit {}), cubes disabled", size, max);
            return;
        }
        let vertex_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Scene Vertex Buffer"),
            contents: bytemuck::cast_slice(vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        self.scene = Some(SceneResources {
            vertex_buffer,
            vertex_count: vertices.len() as u32,
            texture,
        });
    }

    fn upload_distortion_mesh(&mut self, mesh: &DistortionMesh) -> MeshHandle {
        let vertex_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Distortion Vertex Buffer"),
            contents: bytemuck::cast_slice(&mesh.vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Distortion Index Buffer"),
            contents: bytemuck::cast_slice(&mesh.indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        let id = self.next_id();
        self.meshes.insert(
            id,
            GpuMesh {
                vertex_buffer,
                index_buffer,
                index_count: mesh.indices.len() as u32,
            },
        );
        MeshHandle(id)
    }

    fn upload_render_model(
        &mut self,
        name: &str,
        model: &RenderModelData,
        texture: &TextureMapData,
    ) -> Result<GpuModel, AssetLoadError> {
        let upload_error = |reason: String| AssetLoadError::Upload {
            name: name.to_string(),
            reason,
        };
        if model.vertices.is_empty() || model.indices.is_empty() {
            return Err(upload_error("model has no geometry".to_string()));
        }
        if let Some(&bad) = model
            .indices
            .iter()
            .find(|&&i| usize::from(i) >= model.vertices.len())
        {
            return Err(upload_error(format!("index {} out of range", bad)));
        }
        let texture = self
            .create_texture(&format!("{} Diffuse", name), texture)
            .map_err(upload_error)?;

        let vertex_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(name),
            contents: bytemuck::cast_slice(&model.vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(name),
            contents: bytemuck::cast_slice(&model.indices),
            usage: wgpu::BufferUsages::INDEX,
        });

        let mesh_id = self.next_id();
        let index_count = model.indices.len() as u32;
        self.meshes.insert(
            mesh_id,
            GpuMesh {
                vertex_buffer,
                index_buffer,
                index_count,
            },
        );
        let texture_id = u64::from(self.next_id());
        self.textures.insert(texture_id, texture);
        debug!("Uploaded render model {} ({} indices)", name, index_count);

        Ok(GpuModel {
            mesh: MeshHandle(mesh_id),
            texture: TextureHandle(texture_id),
            index_count,
        })
    }

    fn update_controller_axes(&mut self, vertices: &[AxisVertex]) -> u32 {
        let count = vertices.len().min(MAX_AXIS_VERTICES);
        if count < vertices.len() {
            warn!("Dropping {} controller line vertices", vertices.len() - count);
        }
        if count > 0 {
            self.queue
                .write_buffer(&self.axes_buffer, 0, bytemuck::cast_slice(&vertices[..count]));
        }
        count as u32
    }

    fn render_eye(&mut self, pass: &EyePass) {
        let (Some(target), Some(pipelines)) =
            (self.targets.get(&pass.target.target.0), self.eye_pipelines.as_ref())
        else {
            warn!("No render target for the {:?} eye", pass.eye);
            return;
        };

        let draws = &pass.draws[..pass.draws.len().min(MAX_DRAWS_PER_EYE)];
        let uniforms = pack_draw_uniforms(draws, self.uniform_stride as usize);
        if !uniforms.is_empty() {
            self.queue.write_buffer(&self.uniform_buffer, 0, &uniforms);
        }

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Eye Render Encoder"),
        });
        {
            let [r, g, b, a] = pass.clear_color;
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Eye Render Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target.msaa_view.as_ref().unwrap_or(&target.resolved_view),
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &target.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Discard,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            for (slot, draw) in draws.iter().enumerate() {
                let offset = (slot as u64 * self.uniform_stride) as u32;
                match draw {
                    DrawCall::Scene { .. } => {
                        let Some(scene) = &self.scene else { continue };
                        render_pass.set_pipeline(&pipelines.scene);
                        render_pass.set_bind_group(0, &self.uniform_bind_group, &[offset]);
                        render_pass.set_bind_group(1, &scene.texture.bind_group, &[]);
                        render_pass.set_vertex_buffer(0, scene.vertex_buffer.slice(..));
                        render_pass.draw(0..scene.vertex_count, 0..1);
                    }
                    DrawCall::ControllerAxes { vertex_count, .. } => {
                        let count = (*vertex_count).min(MAX_AXIS_VERTICES as u32);
                        render_pass.set_pipeline(&pipelines.axes);
                        render_pass.set_bind_group(0, &self.uniform_bind_group, &[offset]);
                        render_pass.set_vertex_buffer(0, self.axes_buffer.slice(..));
                        render_pass.draw(0..count, 0..1);
                    }
                    DrawCall::RenderModel { model, .. } => {
                        let (Some(mesh), Some(texture)) =
                            (self.meshes.get(&model.mesh.0), self.textures.get(&model.texture.0))
                        else {
                            continue;
                        };
                        render_pass.set_pipeline(&pipelines.render_model);
                        render_pass.set_bind_group(0, &self.uniform_bind_group, &[offset]);
                        render_pass.set_bind_group(1, &texture.bind_group, &[]);
                        render_pass.set_vertex_buffer(0, mesh.vertex_buffer.slice(..));
                        render_pass.set_index_buffer(mesh.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
                        render_pass.draw_indexed(0..mesh.index_count, 0, 0..1);
                    }
                }
            }
        }
        // submitted per eye so the next eye's uniform upload lands after this pass
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    fn resolve(&mut self, target: &EyeTarget) {
        let Some(resources) = self.targets.get(&target.target.0) else {
            return;
        };
        let Some(msaa_view) = &resources.msaa_view else {
            // single-sample targets render straight into the resolve texture
            return;
        };
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Resolve Encoder"),
        });
        {
            let _resolve_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Resolve Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: msaa_view,
                    resolve_target: Some(&resources.resolved_view),
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Discard,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    fn distort(&mut self, mesh: MeshHandle, left: &EyeTarget, right: &EyeTarget) {
        let frame = match self.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost) => {
                self.surface.configure(&self.device, &self.config);
                return;
            }
            Err(e) => {
                warn!("Skipping companion window frame: {}", e);
                return;
            }
        };
        let (Some(lens), Some(left_texture), Some(right_texture)) = (
            self.meshes.get(&mesh.0),
            self.textures.get(&left.resolved.0),
            self.textures.get(&right.resolved.0),
        ) else {
            return;
        };

        let view = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());
        let half = lens.index_count / 2;
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Distortion Encoder"),
        });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Distortion Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            render_pass.set_pipeline(&self.distortion_pipeline);
            render_pass.set_vertex_buffer(0, lens.vertex_buffer.slice(..));
            render_pass.set_index_buffer(lens.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
            // left lens: first half of the index buffer
            render_pass.set_bind_group(0, &left_texture.bind_group, &[]);
            render_pass.draw_indexed(0..half, 0, 0..1);
            render_pass.set_bind_group(0, &right_texture.bind_group, &[]);
            render_pass.draw_indexed(half..lens.index_count, 0, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        self.pending_frame = Some(frame);
    }

    fn present(&mut self, wait_idle: bool) {
        if let Some(frame) = self.pending_frame.take() {
            self.window.pre_present_notify();
            frame.present();
        }
        if wait_idle {
            let _ = self.device.poll(wgpu::Maintain::Wait);
        }
    }

    fn release_render_model(&mut self, model: &GpuModel) {
        self.meshes.remove(&model.mesh.0);
        self.textures.remove(&model.texture.0);
    }
}

impl Drop for WgpuSurface {
    fn drop(&mut self) {
        // let in-flight eye and lens passes finish before resources go away
        let _ = self.device.poll(wgpu::Maintain::Wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Mat4, Vec3};

    #[test]
    fn draw_uniforms_land_at_each_slot() {
        let first = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let second = Mat4::from_scale(Vec3::splat(2.0));
        let draws = [DrawCall::Scene { mvp: first }, DrawCall::Scene { mvp: second }];

        let stride = 256;
        let packed = pack_draw_uniforms(&draws, stride);
        assert_eq!(packed.len(), 2 * stride);

        let matrix_len = std::mem::size_of::<DrawUniforms>();
        let read = |slot: usize| -> [f32; 16] {
            let start = slot * stride;
            let mut out = [0.0f32; 16];
            bytemuck::cast_slice_mut::<f32, u8>(&mut out)
                .copy_from_slice(&packed[start..start + matrix_len]);
            out
        };
        assert_eq!(read(0), first.to_cols_array());
        assert_eq!(read(1), second.to_cols_array());
        assert!(packed[matrix_len..stride].iter().all(|&b| b == 0));
    }

    #[test]
    fn no_draws_packs_nothing() {
        assert!(pack_draw_uniforms(&[], 256).is_empty());
    }
}
