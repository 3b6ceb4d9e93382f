//! Open data published by the Chilean Ministry of Education (MINEDUC) on
//! <https://datosabiertos.mineduc.cl>.

pub mod enrolled_archive;
pub mod graduated_archive;
