use std::path::{Path, PathBuf};

use duckdb::{params, Connection};
use itertools::Itertools;
use jiff::Zoned;
use log::info;
use url::Url;

use crate::{
    error::EtlError,
    etl::{parse::RecordParser, period::SourcePeriod, Dataset},
    utils::lib_duckdb::sql_literal,
};

pub const LISTING_URL: &str = "https://datosabiertos.mineduc.cl/matricula-en-educacion-superior/";

/// Columns of the published enrollment file and their names in the
/// `registro_matriculas` table.
pub const COLUMNS: [(&str, &str); 52] = [
    ("cat_periodo", "periodo"),
    ("id", "id_matricula"),
    ("codigo_unico", "codigo_unico"),
    ("mrun", "mrun"),
    ("gen_alu", "gen_alu"),
    ("fec_nac_alu", "fec_nac_alumno"),
    ("rango_edad", "rango_edad"),
    ("anio_ing_carr_ori", "anio_ing_carr_ori"),
    ("sem_ing_carr_ori", "sem_ing_carr_ori"),
    ("anio_ing_carr_act", "anio_ing_carr_act"),
    ("sem_ing_carr_act", "sem_ing_carr_act"),
    ("tipo_inst_1", "tipo_instituto"),
    ("tipo_inst_2", "tipo_inst_2"),
    ("tipo_inst_3", "tipo_inst_3"),
    ("cod_inst", "cod_institucion"),
    ("nomb_inst", "institución"),
    ("cod_sede", "cod_sede"),
    ("nomb_sede", "nombre_sede"),
    ("cod_carrera", "cod_carrera"),
    ("nomb_carrera", "carrera"),
    ("modalidad", "modalidad"),
    ("jornada", "jornada"),
    ("version", "version"),
    ("tipo_plan_carr", "tipo_plan_carr"),
    ("dur_estudio_carr", "dur_egreso_carrera"),
    ("dur_proceso_tit", "dur_titulacion"),
    ("dur_total_carr", "dur_carrera"),
    ("region_sede", "region_sede"),
    ("provincia_sede", "provincia_sede"),
    ("comuna_sede", "comuna_sede"),
    ("nivel_global", "grado_academico"),
    ("nivel_carrera_1", "nivel_carrera_det"),
    ("nivel_carrera_2", "nivel_carrera"),
    ("requisito_ingreso", "requisito_ingreso"),
    ("vigencia_carrera", "vigencia_carrera"),
    ("formato_valores", "formato_valores"),
    ("valor_matricula", "valor_matricula"),
    ("valor_arancel", "valor_mensualidad"),
    ("codigo_demre", "codigo_demre"),
    ("area_conocimiento", "area_conocimiento"),
    ("cine_f_97_area", "area_carrera"),
    ("cine_f_97_subarea", "subarea_carrera"),
    ("area_carrera_generica", "area_carrera_generica"),
    ("cine_f_13_area", "area_profesion"),
    ("cine_f_13_subarea", "subarea_carrera_2"),
    ("acreditada_carr", "acreditación_carrera"),
    ("acreditada_inst", "acreditación_institucion"),
    ("acre_inst_desde_hasta", "acre_inst_desde_hasta"),
    ("acre_inst_anio", "año_acreditacion"),
    ("costo_proceso_titulacion", "costo_p_titulacion"),
    ("costo_obtencion_titulo_diploma", "costo_diploma"),
    ("forma_ingreso", "forma_ingreso"),
];

/// Enrollment in higher education, one row per student and program.
#[derive(Debug, Clone)]
pub struct EnrolledStudentsArchive {
    pub listing_url: Url,
}

impl EnrolledStudentsArchive {
    pub fn new() -> Result<EnrolledStudentsArchive, EtlError> {
        let listing_url = Url::parse(LISTING_URL)
            .map_err(|e| EtlError::Config(format!("bad listing url {}: {}", LISTING_URL, e)))?;
        Ok(EnrolledStudentsArchive { listing_url })
    }

    /// Bulk insert of one file, read by DuckDB.  Values are trimmed and kept
    /// as text, empty values become NULL.  Blank rows and rows with the wrong
    /// number of fields are skipped, as the parser does.
    fn insert_sql(file: &Path) -> String {
        let targets = COLUMNS
            .iter()
            .map(|(_, target)| format!("\"{}\"", target))
            .join(", ");
        let values: Vec<String> = COLUMNS
            .iter()
            .map(|(source, _)| format!("NULLIF(TRIM(\"{}\"), '')", source))
            .collect();
        format!(
            r"
INSERT INTO registro_matriculas ({}, year, preprocessed_at, processed_at)
    SELECT {}, ?, ?::TIMESTAMP, ?::TIMESTAMP
    FROM read_csv({},
        delim = ';',
        header = true,
        all_varchar = true,
        ignore_errors = true
    )
    WHERE COALESCE({}) IS NOT NULL;",
            targets,
            values.join(", "),
            sql_literal(&file.to_string_lossy()),
            values.join(", ")
        )
    }
}

impl Dataset for EnrolledStudentsArchive {
    fn job_name(&self) -> &str {
        "enrolled_job"
    }

    fn listing_url(&self) -> &Url {
        &self.listing_url
    }

    fn parser(&self) -> RecordParser {
        let required: Vec<&str> = COLUMNS.iter().map(|(source, _)| *source).collect();
        RecordParser::new(b';', &required)
    }

    fn setup(&self, conn: &Connection) -> Result<(), EtlError> {
        let columns = COLUMNS
            .iter()
            .map(|(_, target)| format!("    \"{}\" VARCHAR,", target))
            .join("\n");
        let sql = format!(
            r"
CREATE TABLE IF NOT EXISTS registro_matriculas (
{}
    year INTEGER NOT NULL,
    preprocessed_at TIMESTAMP NOT NULL,
    processed_at TIMESTAMP NOT NULL
);",
            columns
        );
        conn.execute_batch(&sql)?;
        Ok(())
    }

    fn insert(
        &self,
        conn: &Connection,
        files: &[PathBuf],
        period: &SourcePeriod,
    ) -> Result<usize, EtlError> {
        let preprocessed_at = period
            .discovered_at
            .strftime("%Y-%m-%d %H:%M:%S")
            .to_string();
        let processed_at = Zoned::now().strftime("%Y-%m-%d %H:%M:%S").to_string();
        let mut n = 0;
        for file in files {
            let inserted = conn.execute(
                &EnrolledStudentsArchive::insert_sql(file),
                params![period.year, preprocessed_at, processed_at],
            )?;
            info!(
                "  inserted {} rows from {}",
                inserted,
                file.file_name().unwrap_or_default().to_string_lossy()
            );
            n += inserted;
        }
        info!("inserted {} rows into registro_matriculas", n);
        Ok(n)
    }
}
