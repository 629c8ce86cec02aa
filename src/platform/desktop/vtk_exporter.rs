use std::{
    fs::{create_dir_all, File},
    io::Write,
    path::{Path, PathBuf},
};

use vtkio::model::*;

use crate::{error::SimulationError, floating_type_mod::FT, session::FrameSnapshot, V2};

fn to_vec3d(v: &V2) -> [FT; 3] {
    [v[0], v[1], 0.]
}

fn export_error(path: &Path, err: impl std::fmt::Debug) -> SimulationError {
    SimulationError::Export(format!("{}: {:?}", path.display(), err))
}

pub(crate) struct VtkExporter {
    /// something like './data/river' which will get expanded to './data/river-00001.vtk' and './data/river.vtk.series'
    folder: PathBuf,
    basename: String,
    snapshot_number: usize,
    series_file: File,
}

impl VtkExporter {
    pub(crate) fn new(folder: impl Into<PathBuf>, basename: impl Into<String>) -> Result<VtkExporter, SimulationError> {
        let folder: PathBuf = folder.into();
        let basename: String = basename.into();

        create_dir_all(&folder).map_err(|err| export_error(&folder, err))?;

        let series_path = folder.join(format!("{}.vtk.series", basename));
        let mut series_file = File::create(&series_path).map_err(|err| export_error(&series_path, err))?;
        let series_prelude_str = "{\n\"file-series-version\": \"1.0\",\n\"files\": [";
        series_file
            .write_all(series_prelude_str.as_bytes())
            .map_err(|err| export_error(&series_path, err))?;

        Ok(VtkExporter {
            series_file,
            folder,
            basename,
            snapshot_number: 1,
        })
    }

    /// Static boundary particles with their psi weights, written once per reset.
    pub(crate) fn write_boundary(&self, positions: &[V2], psi: &[FT]) -> Result<(), SimulationError> {
        let path = self.folder.join(format!("{}-boundary.vtk", self.basename));
        write_particle_file(path, positions, vec![("psi".into(), psi.to_vec())], Vec::new())
    }

    pub(crate) fn add_snapshot(&mut self, snapshot: &FrameSnapshot) -> Result<(), SimulationError> {
        let series_path = self.folder.join(format!("{}.vtk.series", self.basename));
        if self.snapshot_number > 1 {
            self.series_file
                .write_all(",".as_bytes())
                .map_err(|err| export_error(&series_path, err))?;
        }

        let vtk_filename = format!("{}-{:05}.vtk", self.basename, self.snapshot_number);
        write_particle_file(
            self.folder.join(&vtk_filename),
            &snapshot.positions,
            vec![
                ("density".into(), snapshot.density.clone()),
                ("pressure".into(), snapshot.pressure.clone()),
            ],
            vec![("velocity".into(), snapshot.velocities.clone())],
        )?;

        write!(
            self.series_file,
            "\n{{ \"name\": \"{}\", \"time\": {} }}",
            vtk_filename, snapshot.time
        )
        .map_err(|err| export_error(&series_path, err))?;

        self.snapshot_number += 1;
        Ok(())
    }
}

impl Drop for VtkExporter {
    fn drop(&mut self) {
        let series_end_str = "\n]\n}";
        // nothing sensible left to do if this fails
        let _ = self.series_file.write_all(series_end_str.as_bytes());
    }
}

/// One legacy PolyData file with a vertex cell per particle.
fn write_particle_file(
    path: PathBuf,
    positions: &[V2],
    data_ft: Vec<(String, Vec<FT>)>,
    data_vec: Vec<(String, Vec<V2>)>,
) -> Result<(), SimulationError> {
    let mut data_arrays: Vec<DataArray> = Vec::new();

    for (name, arr) in data_ft {
        let mut data_array = DataArray::scalars(name, 1);
        data_array.data = arr.into();
        data_arrays.push(data_array);
    }

    for (name, arr) in data_vec {
        let mut data_array = DataArray::scalars(name, 3);
        data_array.data = arr.iter().flat_map(to_vec3d).collect::<Vec<_>>().into();
        data_arrays.push(data_array);
    }

    let num_particles = positions.len();
    let vtk_verts: Vec<u32> = (0..num_particles).flat_map(|i| [1, i as u32]).collect();
    let vtk_points: Vec<FT> = positions.iter().flat_map(to_vec3d).collect();

    let vtk = Vtk {
        version: Version::new((4, 2)),
        byte_order: ByteOrder::BigEndian,
        title: String::from("River SPH particles"),
        file_path: Some(path.clone()),
        data: DataSet::PolyData {
            meta: None,
            pieces: vec![Piece::Inline(Box::new(PolyDataPiece {
                points: vtk_points.into(),
                verts: VertexNumbers::Legacy {
                    num_cells: num_particles as u32,
                    vertices: vtk_verts,
                }
                .into(),
                data: Attributes {
                    cell: Vec::new(),
                    point: data_arrays.into_iter().map(Attribute::DataArray).collect(),
                },
                ..Default::default()
            }))],
        },
    };
    vtk.export(&path).map_err(|err| export_error(&path, err))
}
